//! Structured yes/no dialogs for interactive commands.

use std::io::{self, BufRead, IsTerminal, Write};

use console::style;

use crate::error::Result;

/// True when both stdin and stdout are attached to a terminal.
pub fn is_interactive() -> bool {
    io::stdin().is_terminal() && io::stdout().is_terminal()
}

/// A boxed dialog: title, detail lines, then a `[Y/n]` question.
pub struct Dialog<'a> {
    pub title: &'a str,
    pub lines: Vec<String>,
    pub question: &'a str,
    pub default_yes: bool,
}

impl Dialog<'_> {
    /// Print the dialog and read the answer from stdin.
    pub fn confirm(&self) -> Result<bool> {
        let stdin = io::stdin();
        let mut input = stdin.lock();
        self.confirm_with(&mut input, &mut io::stdout())
    }

    fn confirm_with(&self, input: &mut impl BufRead, out: &mut impl Write) -> Result<bool> {
        let dim = style("│").dim();
        writeln!(out)?;
        writeln!(out, "{} {}", style("┌").dim(), style(self.title).bold().cyan())?;
        writeln!(out, "{}", dim)?;
        for line in &self.lines {
            writeln!(out, "{}  {}", dim, line)?;
        }
        writeln!(out, "{}", dim)?;

        let choices = if self.default_yes { "Y/n" } else { "y/N" };
        loop {
            write!(
                out,
                "{} {} {}{}{} ",
                style("└").dim(),
                self.question,
                style("[").bold().cyan(),
                style(choices).bold(),
                style("]").bold().cyan(),
            )?;
            out.flush()?;

            let mut answer = String::new();
            if input.read_line(&mut answer)? == 0 {
                writeln!(out)?;
                return Ok(false);
            }
            match answer.trim().to_lowercase().as_str() {
                "" => return Ok(self.default_yes),
                "y" | "yes" => return Ok(true),
                "n" | "no" => return Ok(false),
                _ => writeln!(out, "    {}", style("Please enter y or n").dim())?,
            }
        }
    }
}

/// Single-line `[y/N]` confirmation for destructive actions.
pub fn confirm(question: &str) -> Result<bool> {
    print!("{} [y/N] ", question);
    io::stdout().flush()?;
    let mut input = String::new();
    io::stdin().read_line(&mut input)?;
    Ok(matches!(input.trim().to_lowercase().as_str(), "y" | "yes"))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn dialog(default_yes: bool) -> Dialog<'static> {
        Dialog {
            title: "VM not running",
            lines: vec!["Backend: lima".into()],
            question: "Start it now?",
            default_yes,
        }
    }

    fn answer(d: &Dialog, input: &str) -> (bool, String) {
        let mut out = Vec::new();
        let ok = d.confirm_with(&mut input.as_bytes(), &mut out).unwrap();
        (ok, String::from_utf8_lossy(&out).into_owned())
    }

    #[test]
    fn empty_answer_takes_default() {
        assert!(answer(&dialog(true), "\n").0);
        assert!(!answer(&dialog(false), "\n").0);
    }

    #[test]
    fn reprompts_on_garbage() {
        let (ok, out) = answer(&dialog(false), "maybe\nyes\n");
        assert!(ok);
        assert!(out.contains("Please enter y or n"));
        assert!(out.contains("Backend: lima"));
    }

    #[test]
    fn eof_declines() {
        assert!(!answer(&dialog(true), "").0);
    }
}
