//! Privilege elevation for remote commands
//!
//! Elevated commands run as `sudo -S -p '' sh -c '<command>'` with the
//! password written to stdin, so the secret never appears in a process list.

/// Prefix used for every elevated command
const SUDO_PREFIX: &str = "sudo -S -p ''";

fn tokenize_shell(segment: &str) -> Vec<String> {
    shell_words::split(segment).unwrap_or_else(|_| {
        segment
            .split_whitespace()
            .map(ToString::to_string)
            .collect()
    })
}

fn is_env_assignment(token: &str) -> bool {
    let Some((key, _)) = token.split_once('=') else {
        return false;
    };
    !key.is_empty() && key.chars().all(|c| c == '_' || c.is_ascii_alphanumeric())
}

/// If `command` is itself a `sudo` invocation, the command to elevate.
///
/// Leading environment assignments are skipped when looking for `sudo`. A
/// plain `sudo cmd ...` yields `cmd ...`; when `sudo` carries its own flags
/// the whole command is kept so those flags still apply.
pub fn elevation_target(command: &str) -> Option<String> {
    let tokens = tokenize_shell(command.trim());
    let env_count = tokens.iter().take_while(|t| is_env_assignment(t)).count();
    let rest = &tokens[env_count..];

    if rest.first().map(String::as_str) != Some("sudo") {
        return None;
    }
    let after = &rest[1..];
    if after.is_empty() {
        return None;
    }
    if after[0].starts_with('-') {
        return Some(command.trim().to_string());
    }

    let mut inner: Vec<&str> = tokens[..env_count].iter().map(String::as_str).collect();
    inner.extend(after.iter().map(String::as_str));
    Some(shell_words::join(inner))
}

/// Wrap `command` for execution through `sudo` reading the password on stdin
pub fn elevated_command(command: &str) -> String {
    format!("{} sh -c {}", SUDO_PREFIX, shell_words::quote(command))
}

/// Stdin payload for an elevated command
pub fn password_stdin(secret: &str) -> String {
    format!("{}\n", secret)
}

/// Messages sudo prints when the password on stdin is refused
const SUDO_REJECTIONS: &[&str] = &[
    "incorrect password attempt",
    "Sorry, try again.",
    "no password was provided",
    "a password is required",
];

/// Whether an elevated command failed because sudo refused the password
pub fn sudo_rejected(status: i32, stderr: &str) -> bool {
    status != 0 && SUDO_REJECTIONS.iter().any(|m| stderr.contains(m))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_sudo_rejection_detection() {
        assert!(sudo_rejected(1, "Sorry, try again.\nsudo: 1 incorrect password attempt\n"));
        assert!(sudo_rejected(1, "sudo: no password was provided\n"));
        assert!(!sudo_rejected(0, "Sorry, try again.\n"));
        assert!(!sudo_rejected(2, "ls: cannot access 'x': No such file or directory\n"));
    }

    #[test]
    fn test_plain_commands_are_not_elevated() {
        assert_eq!(elevation_target("ls -la"), None);
        assert_eq!(elevation_target("echo sudo"), None);
        assert_eq!(elevation_target("sudo"), None);
    }

    #[test]
    fn test_leading_sudo_is_stripped() {
        assert_eq!(elevation_target("sudo apt update").as_deref(), Some("apt update"));
        let inner = elevation_target("DEBIAN_FRONTEND=noninteractive sudo apt install -y nginx")
            .unwrap();
        assert_eq!(
            shell_words::split(&inner).unwrap(),
            vec!["DEBIAN_FRONTEND=noninteractive", "apt", "install", "-y", "nginx"]
        );
    }

    #[test]
    fn test_sudo_flags_keep_whole_command() {
        assert_eq!(
            elevation_target("sudo -u postgres psql").as_deref(),
            Some("sudo -u postgres psql")
        );
    }

    #[test]
    fn test_elevated_command_quotes_payload() {
        assert_eq!(
            elevated_command("systemctl restart nginx"),
            "sudo -S -p '' sh -c 'systemctl restart nginx'"
        );
        let wrapped = elevated_command("echo 'hi' > /tmp/x");
        let tokens = shell_words::split(&wrapped).unwrap();
        assert_eq!(tokens[..5], ["sudo", "-S", "-p", "", "sh"]);
        assert_eq!(tokens[6], "echo 'hi' > /tmp/x");
    }
}
