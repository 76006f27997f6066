//! Authentication orchestration
//!
//! Builds the prioritized list of client auth methods from the supplied
//! inputs (private key, passphrase, TOTP URL) and drives them against the
//! server in order, including answering keyboard-interactive challenges.

use std::path::Path;
use std::sync::Arc;

use russh::client::{self, AuthResult, KeyboardInteractiveAuthResponse};
use russh::keys::{load_secret_key, PrivateKey, PrivateKeyWithHashAlg};
use totp_rs::TOTP;
use tracing::{debug, info};

use crate::error::TunnelError;

/// Server prompt answered with the login passphrase.
pub const PASSWORD_CHALLENGE: &str = "password: ";

/// Server prompt answered with a freshly generated TOTP code.
pub const GAUTH_CHALLENGE: &str = "google-authenticator-code: ";

/// One client authentication method, in the order it is offered.
#[derive(Debug)]
pub enum AuthMethod {
    PublicKey { key: Arc<PrivateKey> },
    Password { password: String },
    KeyboardInteractive { responder: ChallengeResponder },
}

impl AuthMethod {
    fn name(&self) -> &'static str {
        match self {
            AuthMethod::PublicKey { .. } => "publickey",
            AuthMethod::Password { .. } => "password",
            AuthMethod::KeyboardInteractive { .. } => "keyboard-interactive",
        }
    }
}

/// Assemble the auth method list: public key, then password, then
/// keyboard-interactive, each included only when its input is present.
///
/// A key path that fails to load is a hard error. An empty list is a
/// configuration error, reported before any dialing happens.
pub fn build_auth_methods(
    key_path: Option<&Path>,
    passphrase: Option<&str>,
    totp_url: Option<&str>,
) -> Result<Vec<AuthMethod>, TunnelError> {
    let mut methods = Vec::new();

    if let Some(path) = key_path.filter(|p| !p.as_os_str().is_empty()) {
        let key = load_secret_key(path, None).map_err(|e| {
            TunnelError::KeyError(format!(
                "could not load private key from '{}': {}",
                path.display(),
                e
            ))
        })?;
        methods.push(AuthMethod::PublicKey { key: Arc::new(key) });
    }

    if let Some(pass) = passphrase.filter(|p| !p.is_empty()) {
        methods.push(AuthMethod::Password {
            password: pass.to_string(),
        });
    }

    if let Some(url) = totp_url.filter(|u| !u.is_empty()) {
        methods.push(AuthMethod::KeyboardInteractive {
            responder: ChallengeResponder::new(
                passphrase.unwrap_or_default().to_string(),
                url.to_string(),
            ),
        });
    }

    if methods.is_empty() {
        return Err(TunnelError::Config(
            "no authentication methods available; supply a key path, passphrase, or TOTP URL"
                .into(),
        ));
    }

    Ok(methods)
}

/// Answers keyboard-interactive challenges by matching the server's prompt
/// text: the password challenge gets the passphrase, the
/// google-authenticator challenge gets an RFC 6238 code derived from the
/// `otpauth://` URL's secret and the current wall clock. Anything else is an
/// unrecognized challenge and aborts authentication.
#[derive(Debug)]
pub struct ChallengeResponder {
    passphrase: String,
    totp_url: String,
}

impl ChallengeResponder {
    pub fn new(passphrase: String, totp_url: String) -> Self {
        Self {
            passphrase,
            totp_url,
        }
    }

    /// Answer one server prompt.
    pub fn answer(&self, prompt: &str) -> Result<String, TunnelError> {
        match prompt {
            PASSWORD_CHALLENGE => Ok(self.passphrase.clone()),
            GAUTH_CHALLENGE => self.code_now(),
            other => Err(TunnelError::AuthenticationFailed(format!(
                "unrecognized challenge: '{}'",
                other
            ))),
        }
    }

    /// Six-digit code for the current wall-clock time.
    pub fn code_now(&self) -> Result<String, TunnelError> {
        self.totp()?.generate_current().map_err(|e| {
            TunnelError::AuthenticationFailed(format!("system clock error generating TOTP: {}", e))
        })
    }

    /// Six-digit code for a fixed unix timestamp.
    pub fn code_at(&self, unix_secs: u64) -> Result<String, TunnelError> {
        Ok(self.totp()?.generate(unix_secs))
    }

    fn totp(&self) -> Result<TOTP, TunnelError> {
        TOTP::from_url(&self.totp_url)
            .map_err(|e| TunnelError::Config(format!("invalid TOTP URL: {}", e)))
    }
}

/// Offer each method to the server in order until one succeeds. Rejections
/// and partial successes fall through to the next method; exhausting the
/// list is an authentication failure.
pub(crate) async fn authenticate<H: client::Handler>(
    handle: &mut client::Handle<H>,
    username: &str,
    methods: &[AuthMethod],
) -> Result<(), TunnelError> {
    let mut last_remaining = String::new();

    for method in methods {
        debug!(method = method.name(), user = username, "offering auth method");

        let result = match method {
            AuthMethod::PublicKey { key } => {
                let key_with_alg = PrivateKeyWithHashAlg::new(
                    key.clone(),
                    handle.best_supported_rsa_hash().await?.flatten(),
                );
                handle
                    .authenticate_publickey(username, key_with_alg)
                    .await?
            }
            AuthMethod::Password { password } => {
                handle.authenticate_password(username, password).await?
            }
            AuthMethod::KeyboardInteractive { responder } => {
                if keyboard_interactive(handle, username, responder).await? {
                    return Ok(());
                }
                continue;
            }
        };

        match result {
            AuthResult::Success => {
                info!(method = method.name(), user = username, "authentication successful");
                return Ok(());
            }
            AuthResult::Failure {
                remaining_methods,
                partial_success,
            } => {
                let methods: Vec<String> = remaining_methods
                    .iter()
                    .map(|m| {
                        let s: &str = m.into();
                        s.to_string()
                    })
                    .collect();
                last_remaining = methods.join(", ");
                debug!(
                    method = method.name(),
                    partial_success,
                    remaining = %last_remaining,
                    "auth method rejected, trying next"
                );
            }
        }
    }

    let detail = if last_remaining.is_empty() {
        "all offered methods rejected by server".to_string()
    } else {
        format!(
            "all offered methods rejected by server; server still requires: {}",
            last_remaining
        )
    };
    Err(TunnelError::AuthenticationFailed(detail))
}

/// Drive one keyboard-interactive exchange, answering every prompt through
/// the responder. Returns Ok(false) on a server-side rejection so the caller
/// can fall through; an unrecognized challenge is a hard error.
async fn keyboard_interactive<H: client::Handler>(
    handle: &mut client::Handle<H>,
    username: &str,
    responder: &ChallengeResponder,
) -> Result<bool, TunnelError> {
    let mut response = handle
        .authenticate_keyboard_interactive_start(username, None)
        .await?;

    loop {
        match response {
            KeyboardInteractiveAuthResponse::Success => return Ok(true),

            KeyboardInteractiveAuthResponse::Failure {
                remaining_methods,
                partial_success,
            } => {
                let methods: Vec<String> = remaining_methods
                    .iter()
                    .map(|m| {
                        let s: &str = m.into();
                        s.to_string()
                    })
                    .collect();
                debug!(
                    partial_success,
                    remaining = %methods.join(", "),
                    "keyboard-interactive rejected"
                );
                return Ok(false);
            }

            KeyboardInteractiveAuthResponse::InfoRequest { prompts, .. } => {
                // Some servers send an info request with zero prompts; the
                // correct reply is zero responses.
                let mut answers = Vec::with_capacity(prompts.len());
                for prompt in &prompts {
                    answers.push(responder.answer(&prompt.prompt)?);
                }
                response = handle
                    .authenticate_keyboard_interactive_respond(answers)
                    .await?;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    // RFC 6238 test secret "12345678901234567890" in base32.
    const TOTP_URL: &str = "otpauth://totp/sshovel:demo?secret=GEZDGNBVGY3TQOJQGEZDGNBVGY3TQOJQ&issuer=sshovel";

    #[test]
    fn test_password_challenge_answered_with_passphrase() {
        let r = ChallengeResponder::new("hunter2".into(), TOTP_URL.into());
        assert_eq!(r.answer(PASSWORD_CHALLENGE).unwrap(), "hunter2");
    }

    #[test]
    fn test_unrecognized_challenge_is_hard_error() {
        let r = ChallengeResponder::new("hunter2".into(), TOTP_URL.into());
        let err = r.answer("favorite color: ").unwrap_err();
        assert!(err.to_string().contains("unrecognized challenge"));
    }

    #[test]
    fn test_totp_code_at_fixed_clock_matches_rfc_6238() {
        let r = ChallengeResponder::new(String::new(), TOTP_URL.into());
        // RFC 6238 appendix B, T = 59 s, SHA-1: truncated 6-digit code.
        assert_eq!(r.code_at(59).unwrap(), "287082");
        assert_eq!(r.code_at(1111111109).unwrap(), "081804");
    }

    #[test]
    fn test_totp_code_is_six_digits() {
        let r = ChallengeResponder::new(String::new(), TOTP_URL.into());
        let code = r.code_at(1234567890).unwrap();
        assert_eq!(code.len(), 6);
        assert!(code.chars().all(|c| c.is_ascii_digit()));
    }

    #[test]
    fn test_invalid_totp_url_rejected() {
        let r = ChallengeResponder::new(String::new(), "not a url".into());
        assert!(r.code_at(0).is_err());
    }

    #[test]
    fn test_method_list_order_and_inclusion() {
        let methods = build_auth_methods(None, Some("pw"), Some(TOTP_URL)).unwrap();
        assert_eq!(methods.len(), 2);
        assert!(matches!(methods[0], AuthMethod::Password { .. }));
        assert!(matches!(methods[1], AuthMethod::KeyboardInteractive { .. }));
    }

    #[test]
    fn test_empty_inputs_fail_before_dialing() {
        let err = build_auth_methods(None, None, None).unwrap_err();
        assert!(matches!(err, TunnelError::Config(_)));

        // empty strings count as absent
        let err = build_auth_methods(None, Some(""), Some("")).unwrap_err();
        assert!(matches!(err, TunnelError::Config(_)));
    }

    #[test]
    fn test_bad_key_path_is_hard_error() {
        let err = build_auth_methods(
            Some(Path::new("/nonexistent/sshovel-test-key")),
            Some("pw"),
            None,
        )
        .unwrap_err();
        assert!(matches!(err, TunnelError::KeyError(_)));
    }
}
