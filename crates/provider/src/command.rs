//! Helper-subprocess token provider
//!
//! The browser-automation scrape that turns credentials into tokens lives in
//! an external helper program (it drives real browsers and has its own
//! dependency world). This provider runs the helper, hands it the
//! credentials via environment variables, and parses a `TokenSet` JSON
//! object from its stdout.
//!
//! Credentials are never placed on the command line (visible in `ps`) and
//! never logged. The helper is given a hard timeout; a wedged browser must
//! not stall the fetch window forever.

use std::future::Future;
use std::pin::Pin;
use std::process::Stdio;
use std::time::Duration;

use tokio::process::Command;
use tracing::{debug, warn};

use crate::{Error, Result, TokenProvider, TokenSet};

/// Environment variable carrying the account login for the helper.
pub const LOGIN_ENV: &str = "UNLOCK_LOGIN";
/// Environment variable carrying the account secret for the helper.
pub const SECRET_ENV: &str = "UNLOCK_SECRET";

/// Token provider that shells out to a configured helper command.
pub struct CommandTokenProvider {
    program: String,
    args: Vec<String>,
    timeout: Duration,
}

impl CommandTokenProvider {
    pub fn new(program: String, args: Vec<String>, timeout: Duration) -> Self {
        Self {
            program,
            args,
            timeout,
        }
    }

    async fn run(&self, login: &str, secret: &str) -> Result<TokenSet> {
        let mut command = Command::new(&self.program);
        command
            .args(&self.args)
            .env(LOGIN_ENV, login)
            .env(SECRET_ENV, secret)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);

        let output = match tokio::time::timeout(self.timeout, command.output()).await {
            Ok(Ok(output)) => output,
            Ok(Err(e)) => {
                return Err(Error::Fetch(format!(
                    "failed to run token helper {}: {e}",
                    self.program
                )));
            }
            Err(_) => return Err(Error::Timeout(self.timeout.as_secs())),
        };

        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr);
            warn!(
                program = %self.program,
                status = %output.status,
                "token helper exited with failure"
            );
            return Err(Error::Fetch(format!(
                "token helper exited with {}: {}",
                output.status,
                stderr.trim()
            )));
        }

        // The helper may print progress lines before the result; the token
        // set is the last non-empty stdout line.
        let stdout = String::from_utf8_lossy(&output.stdout);
        let payload = stdout
            .lines()
            .rev()
            .find(|line| !line.trim().is_empty())
            .ok_or_else(|| Error::Parse("helper produced no output".into()))?;

        let tokens: TokenSet = serde_json::from_str(payload.trim())
            .map_err(|e| Error::Parse(format!("invalid helper output: {e}")))?;

        debug!(program = %self.program, "token helper completed");
        Ok(tokens)
    }
}

impl TokenProvider for CommandTokenProvider {
    fn fetch<'a>(
        &'a self,
        login: &'a str,
        secret: &'a str,
    ) -> Pin<Box<dyn Future<Output = Result<TokenSet>> + Send + 'a>> {
        Box::pin(self.run(login, secret))
    }
}

#[cfg(test)]
#[cfg(unix)]
mod tests {
    use super::*;

    fn shell_provider(script: &str, timeout: Duration) -> CommandTokenProvider {
        CommandTokenProvider::new("sh".into(), vec!["-c".into(), script.into()], timeout)
    }

    #[tokio::test]
    async fn parses_token_set_from_stdout() {
        let provider = shell_provider(
            r#"printf '{"new_bbs_serviceToken":"svc-1","popRunToken":"run-1"}\n'"#,
            Duration::from_secs(5),
        );

        let tokens = provider.fetch("user@example.com", "pw").await.unwrap();
        assert_eq!(tokens.service_token, "svc-1");
        assert_eq!(tokens.run_token, "run-1");
        assert!(tokens.is_complete());
    }

    #[tokio::test]
    async fn takes_last_nonempty_line() {
        let provider = shell_provider(
            concat!(
                r#"printf 'starting browser...\n'; "#,
                r#"printf '{"new_bbs_serviceToken":"svc-2","popRunToken":"run-2"}\n\n'"#
            ),
            Duration::from_secs(5),
        );

        let tokens = provider.fetch("login", "secret").await.unwrap();
        assert_eq!(tokens.service_token, "svc-2");
    }

    #[tokio::test]
    async fn credentials_arrive_via_environment() {
        let provider = shell_provider(
            r#"printf '{"new_bbs_serviceToken":"%s","popRunToken":"%s"}\n' "$UNLOCK_LOGIN" "$UNLOCK_SECRET""#,
            Duration::from_secs(5),
        );

        let tokens = provider.fetch("env-login", "env-secret").await.unwrap();
        assert_eq!(tokens.service_token, "env-login");
        assert_eq!(tokens.run_token, "env-secret");
    }

    #[tokio::test]
    async fn nonzero_exit_is_fetch_error() {
        let provider = shell_provider("echo 'login form changed' >&2; exit 3", Duration::from_secs(5));

        let err = provider.fetch("login", "secret").await.unwrap_err();
        match err {
            Error::Fetch(msg) => assert!(msg.contains("login form changed"), "got: {msg}"),
            other => panic!("expected Fetch, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn garbage_output_is_parse_error() {
        let provider = shell_provider("echo 'not json at all'", Duration::from_secs(5));

        let err = provider.fetch("login", "secret").await.unwrap_err();
        assert!(matches!(err, Error::Parse(_)), "got {err:?}");
    }

    #[tokio::test]
    async fn slow_helper_times_out() {
        let provider = shell_provider("sleep 30", Duration::from_millis(100));

        let err = provider.fetch("login", "secret").await.unwrap_err();
        assert!(matches!(err, Error::Timeout(_)), "got {err:?}");
    }

    #[tokio::test]
    async fn missing_program_is_fetch_error() {
        let provider = CommandTokenProvider::new(
            "/nonexistent/token-helper".into(),
            vec![],
            Duration::from_secs(5),
        );

        let err = provider.fetch("login", "secret").await.unwrap_err();
        assert!(matches!(err, Error::Fetch(_)), "got {err:?}");
    }
}
