use std::fmt;

use async_trait::async_trait;
use pgwire::api::auth::{AuthSource, LoginInfo, Password};
use pgwire::error::{ErrorInfo, PgWireError, PgWireResult};
use thiserror::Error;
use tracing::debug;

#[derive(Debug, Error, PartialEq, Eq)]
pub enum AuthError {
    #[error("the salon password must not be empty")]
    EmptyPassword,
}

/// One shared password for every front-desk and staff client.
///
/// The user name is not checked against a list, but it must be present:
/// bookings and status changes are traced per login.
pub struct ChairtimeAuthSource {
    password: Vec<u8>,
}

impl ChairtimeAuthSource {
    pub fn new(password: String) -> Result<Self, AuthError> {
        if password.trim().is_empty() {
            return Err(AuthError::EmptyPassword);
        }
        Ok(Self { password: password.into_bytes() })
    }

    fn password_for(&self, user: Option<&str>) -> PgWireResult<Password> {
        match user.map(str::trim) {
            Some(user) if !user.is_empty() => {
                debug!(user, "password lookup");
                Ok(Password::new(None, self.password.clone()))
            }
            _ => Err(PgWireError::UserError(Box::new(ErrorInfo::new(
                "FATAL".into(),
                "28000".into(),
                "a user name is required".into(),
            )))),
        }
    }
}

impl fmt::Debug for ChairtimeAuthSource {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ChairtimeAuthSource")
            .field("password", &"<redacted>")
            .finish()
    }
}

#[async_trait]
impl AuthSource for ChairtimeAuthSource {
    async fn get_password(&self, login: &LoginInfo) -> PgWireResult<Password> {
        self.password_for(login.user())
    }
}
