//! cloud-init user-data for agent containers.

use std::collections::BTreeMap;

use minijinja::{AutoEscape, Environment, context};

use crate::error::{Error, Result};

pub const AGENT_USER: &str = "agent";
pub const AGENT_UID: u32 = 1000;
pub const AGENT_PORT: u16 = 8888;
pub const AGENT_PORT_SOURCE: &str = "10.0.0.0/8";

const USER_DATA: &str = r#"#cloud-config
hostname: {{ hostname }}
manage_etc_hosts: true
users:
  - name: {{ user }}
    uid: {{ uid }}
    shell: /bin/bash
    groups: [sudo]
    lock_passwd: true
{%- if ssh_public_key %}
    ssh_authorized_keys:
      - '{{ ssh_public_key }}'
{%- endif %}
write_files:
  - path: /etc/sudoers.d/90-{{ user }}
    permissions: '0440'
    content: |
      {{ user }} ALL=(ALL) NOPASSWD:ALL
  - path: /etc/ssh/sshd_config.d/60-coop.conf
    permissions: '0644'
    content: |
      PermitRootLogin no
      PasswordAuthentication no
      KbdInteractiveAuthentication no
      PubkeyAuthentication yes
      X11Forwarding no
      AllowAgentForwarding yes
      AllowTcpForwarding yes
  - path: /home/{{ user }}/.bashrc.d/00-coop.sh
    owner: {{ user }}:{{ user }}
    permissions: '0644'
    defer: true
    content: |
      export COOP_CONTAINER={{ hostname }}
      export PATH="$HOME/.local/bin:$HOME/go/bin:$HOME/.cargo/bin:$PATH"
{%- for line in env_lines %}
      {{ line }}
{%- endfor %}
runcmd:
  - [sh, -c, 'grep -q bashrc.d /home/{{ user }}/.bashrc || printf "%s\n" "for f in ~/.bashrc.d/*.sh; do [ -r \"\$f\" ] && . \"\$f\"; done" >> /home/{{ user }}/.bashrc']
  - [chown, -R, '{{ user }}:{{ user }}', /home/{{ user }}]
  - [ufw, default, deny, incoming]
  - [ufw, default, allow, outgoing]
  - [ufw, allow, 22/tcp]
  - [ufw, allow, from, {{ port_source }}, to, any, port, '{{ port }}', proto, tcp]
  - [ufw, --force, enable]
  - [sh, -c, 'systemctl restart ssh || systemctl restart sshd']
"#;

/// Inputs of one user-data document.
#[derive(Debug, Clone, Default)]
pub struct UserData {
    pub hostname: String,
    pub ssh_public_key: Option<String>,
    pub env: BTreeMap<String, String>,
}

impl UserData {
    pub fn render(&self) -> Result<String> {
        let mut env = Environment::new();
        env.set_auto_escape_callback(|_| AutoEscape::None);
        env.set_keep_trailing_newline(true);

        let key = self
            .ssh_public_key
            .as_deref()
            .map(|k| k.trim().replace('\'', "''"))
            .filter(|k| !k.is_empty());
        let env_lines: Vec<String> = self
            .env
            .iter()
            .map(|(k, v)| format!("export {}={}", k, shell_quote(v)))
            .collect();

        env.render_str(
            USER_DATA,
            context! {
                hostname => self.hostname,
                user => AGENT_USER,
                uid => AGENT_UID,
                ssh_public_key => key,
                env_lines => env_lines,
                port => AGENT_PORT,
                port_source => AGENT_PORT_SOURCE,
            },
        )
        .map_err(|e| Error::Protocol(format!("render cloud-init user-data: {}", e)))
    }
}

/// Single-quote `value` for POSIX shells.
pub fn shell_quote(value: &str) -> String {
    format!("'{}'", value.replace('\'', r"'\''"))
}
