//! CHAOS credentials.
//!
//! The API accepts either a control login or an account login as form
//! parameters on every call. Values are kept out of `Debug` output and are
//! scrubbed from any response text surfaced in errors.

use std::fmt;

const MASK: &str = "***";

/// A credential value that never prints itself.
#[derive(Clone, PartialEq, Eq)]
pub struct Secret(String);

impl Secret {
    pub fn new(value: impl Into<String>) -> Self {
        Self(value.into())
    }

    pub fn expose(&self) -> &str {
        &self.0
    }
}

impl fmt::Debug for Secret {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(MASK)
    }
}

impl fmt::Display for Secret {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(MASK)
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Credentials {
    ControlLogin { login: Secret, password: Secret },
    Account { number: Secret, password: Secret },
}

impl Credentials {
    pub fn control_login(login: impl Into<String>, password: impl Into<String>) -> Self {
        Credentials::ControlLogin {
            login: Secret::new(login),
            password: Secret::new(password),
        }
    }

    pub fn account(number: impl Into<String>, password: impl Into<String>) -> Self {
        Credentials::Account {
            number: Secret::new(number),
            password: Secret::new(password),
        }
    }

    pub fn mode(&self) -> &'static str {
        match self {
            Credentials::ControlLogin { .. } => "control_login",
            Credentials::Account { .. } => "account",
        }
    }

    /// Form parameters attached to every request.
    pub(crate) fn form_params(&self) -> Vec<(String, String)> {
        match self {
            Credentials::ControlLogin { login, password } => vec![
                ("control_login".to_string(), login.expose().to_string()),
                ("control_password".to_string(), password.expose().to_string()),
            ],
            Credentials::Account { number, password } => vec![
                ("account_number".to_string(), number.expose().to_string()),
                ("account_password".to_string(), password.expose().to_string()),
            ],
        }
    }

    /// Replaces every occurrence of a credential value in `text`.
    pub fn redact(&self, text: &str) -> String {
        let (id, password) = match self {
            Credentials::ControlLogin { login, password } => (login, password),
            Credentials::Account { number, password } => (number, password),
        };
        let mut out = text.to_string();
        // Longest first so a login containing the password (or vice versa) is fully masked.
        let mut values = [id.expose(), password.expose()];
        values.sort_by_key(|v| std::cmp::Reverse(v.len()));
        for value in values {
            if !value.is_empty() {
                out = out.replace(value, MASK);
            }
        }
        out
    }
}
