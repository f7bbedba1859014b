//! Host key confirmation
//!
//! The verifier asks a [`HostKeyPrompt`] before trusting an unknown host.
//! Interactive use goes through [`ConsolePrompt`]; non-interactive callers
//! pick [`AutoAccept`] or [`AutoReject`], or pass a closure.

use std::io::{self, BufRead, Write};

use tracing::{debug, warn};

/// Decides whether an unknown host key should be trusted
pub trait HostKeyPrompt: Send + Sync {
    fn confirm(&self, host: &str, key_type: &str, fingerprint: &str) -> bool;
}

impl<F> HostKeyPrompt for F
where
    F: Fn(&str, &str, &str) -> bool + Send + Sync,
{
    fn confirm(&self, host: &str, key_type: &str, fingerprint: &str) -> bool {
        self(host, key_type, fingerprint)
    }
}

/// Trust every unknown host (the `--yes` flag)
#[derive(Debug, Clone, Copy, Default)]
pub struct AutoAccept;

impl HostKeyPrompt for AutoAccept {
    fn confirm(&self, host: &str, _key_type: &str, fingerprint: &str) -> bool {
        warn!(
            "Auto-accepting unknown host key for {} ({})",
            host, fingerprint
        );
        true
    }
}

/// Refuse every unknown host
#[derive(Debug, Clone, Copy, Default)]
pub struct AutoReject;

impl HostKeyPrompt for AutoReject {
    fn confirm(&self, host: &str, _key_type: &str, fingerprint: &str) -> bool {
        debug!("Rejecting unknown host key for {} ({})", host, fingerprint);
        false
    }
}

/// Asks the operator on stdout/stdin
#[derive(Debug, Clone, Copy, Default)]
pub struct ConsolePrompt;

impl HostKeyPrompt for ConsolePrompt {
    fn confirm(&self, host: &str, key_type: &str, fingerprint: &str) -> bool {
        let stdin = io::stdin();
        let stdout = io::stdout();
        ask(&mut stdin.lock(), &mut stdout.lock(), host, key_type, fingerprint)
    }
}

/// Print the confirmation question and read one answer line
///
/// Only `yes`/`y` (any case) confirms. Read errors and end of input decline.
pub fn ask<R: BufRead, W: Write>(
    input: &mut R,
    output: &mut W,
    host: &str,
    key_type: &str,
    fingerprint: &str,
) -> bool {
    let written = write!(
        output,
        "The authenticity of host '{}' can't be established.\n\
         {} key fingerprint is {}.\n\
         Are you sure you want to continue connecting (yes/no)? ",
        host, key_type, fingerprint
    )
    .and_then(|_| output.flush());
    if let Err(e) = written {
        warn!("Failed to write host key prompt: {}", e);
        return false;
    }

    let mut answer = String::new();
    match input.read_line(&mut answer) {
        Ok(0) => false,
        Ok(_) => is_yes(&answer),
        Err(e) => {
            warn!("Failed to read host key confirmation: {}", e);
            false
        }
    }
}

fn is_yes(answer: &str) -> bool {
    let answer = answer.trim().to_lowercase();
    answer == "yes" || answer == "y"
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Cursor;

    fn answer(input: &str) -> (bool, String) {
        let mut reader = Cursor::new(input.as_bytes().to_vec());
        let mut out = Vec::new();
        let confirmed = ask(&mut reader, &mut out, "web1", "ssh-ed25519", "SHA256:abc");
        (confirmed, String::from_utf8(out).unwrap())
    }

    #[test]
    fn test_prompt_text() {
        let (_, text) = answer("no\n");
        assert!(text.contains("'web1'"));
        assert!(text.contains("ssh-ed25519 key fingerprint is SHA256:abc."));
        assert!(text.ends_with("(yes/no)? "));
    }

    #[test]
    fn test_accepts_yes_variants() {
        assert!(answer("yes\n").0);
        assert!(answer("Y\n").0);
        assert!(answer("  YES  \r\n").0);
    }

    #[test]
    fn test_declines_everything_else() {
        assert!(!answer("no\n").0);
        assert!(!answer("yep\n").0);
        assert!(!answer("\n").0);
        // End of input
        assert!(!answer("").0);
    }

    #[test]
    fn test_policies_and_closures() {
        assert!(AutoAccept.confirm("h", "ssh-rsa", "fp"));
        assert!(!AutoReject.confirm("h", "ssh-rsa", "fp"));

        let only_web = |host: &str, _: &str, _: &str| host == "web";
        assert!(only_web.confirm("web", "ssh-rsa", "fp"));
        assert!(!only_web.confirm("db", "ssh-rsa", "fp"));
    }
}
