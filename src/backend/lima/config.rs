//! Lima configuration YAML generation.

use serde_yaml::Value;

use crate::backend::{VmSpec, VmType};
use crate::error::{Error, Result};

const INCUS_GUEST_SOCKET: &str = "/var/lib/incus/unix.socket";

/// Host side of the forwarded Incus socket, relative to the instance dir.
pub const INCUS_HOST_SOCKET: &str = "sock/incus.sock";

/// Generate Lima configuration YAML for an Incus host VM.
pub fn generate_lima_config(spec: &VmSpec, vm_type: VmType) -> Result<String> {
    let mut config = serde_yaml::Mapping::new();

    let (image_url, image_arch) = if spec.arch == "aarch64" {
        (
            "https://cloud-images.ubuntu.com/releases/24.04/release/ubuntu-24.04-server-cloudimg-arm64.img",
            "aarch64",
        )
    } else {
        (
            "https://cloud-images.ubuntu.com/releases/24.04/release/ubuntu-24.04-server-cloudimg-amd64.img",
            "x86_64",
        )
    };

    let mut image_config = serde_yaml::Mapping::new();
    image_config.insert("location".into(), image_url.into());
    image_config.insert("arch".into(), image_arch.into());
    config.insert("images".into(), vec![Value::Mapping(image_config)].into());
    config.insert("arch".into(), image_arch.into());
    config.insert("vmType".into(), vm_type.as_str().into());

    if spec.rosetta {
        let mut rosetta = serde_yaml::Mapping::new();
        rosetta.insert("enabled".into(), true.into());
        rosetta.insert("binfmt".into(), true.into());

        let mut vz = serde_yaml::Mapping::new();
        vz.insert("rosetta".into(), rosetta.into());

        let mut vm_opts = serde_yaml::Mapping::new();
        vm_opts.insert("vz".into(), vz.into());
        config.insert("vmOpts".into(), vm_opts.into());
    }
    if spec.nested_virtualization {
        config.insert("nestedVirtualization".into(), true.into());
    }

    config.insert("cpus".into(), Value::Number(spec.cpus.into()));
    config.insert("memory".into(), format!("{}GiB", spec.memory_gib).into());
    config.insert("disk".into(), format!("{}GiB", spec.disk_gib).into());

    if !spec.dns.is_empty() {
        let dns: Vec<Value> = spec.dns.iter().map(|s| Value::from(s.as_str())).collect();
        config.insert("dns".into(), dns.into());
        config.insert("hostResolver".into(), {
            let mut resolver = serde_yaml::Mapping::new();
            resolver.insert("enabled".into(), false.into());
            resolver.into()
        });
    }

    // Incus replaces containerd inside the VM.
    let mut containerd = serde_yaml::Mapping::new();
    containerd.insert("system".into(), false.into());
    containerd.insert("user".into(), false.into());
    config.insert("containerd".into(), containerd.into());

    // No host mounts: containers get their own disk devices.
    config.insert("mounts".into(), Value::Sequence(Vec::new()));

    let system_script = r#"#!/bin/bash
set -eux
if ! command -v incus >/dev/null 2>&1; then
  apt-get update
  apt-get install -y --no-install-recommends incus
fi
incus admin init --auto
usermod -aG incus-admin "{{.User}}" || true
"#;
    let mut system_provision = serde_yaml::Mapping::new();
    system_provision.insert("mode".into(), "system".into());
    system_provision.insert("script".into(), system_script.into());
    config.insert(
        "provision".into(),
        vec![Value::Mapping(system_provision)].into(),
    );

    let mut forward = serde_yaml::Mapping::new();
    forward.insert("guestSocket".into(), INCUS_GUEST_SOCKET.into());
    forward.insert(
        "hostSocket".into(),
        format!("{{{{.Dir}}}}/{}", INCUS_HOST_SOCKET).into(),
    );
    config.insert(
        "portForwards".into(),
        vec![Value::Mapping(forward)].into(),
    );

    serde_yaml::to_string(&config)
        .map_err(|e| Error::Protocol(format!("failed to render lima config: {}", e)))
}
