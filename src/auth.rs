use async_trait::async_trait;
use pgwire::api::auth::{AuthSource, LoginInfo, Password};
use pgwire::api::ClientInfo;
use pgwire::error::{ErrorInfo, PgWireError, PgWireResult};

use crate::limits::MAX_CALLER_ID_LEN;
use crate::model::CallerId;

/// Shared-password authentication. The login user name becomes the caller
/// identity of every statement on the connection.
#[derive(Debug)]
pub struct RoombookAuthSource {
    password: String,
}

impl RoombookAuthSource {
    pub fn new(password: String) -> Self {
        Self { password }
    }
}

#[async_trait]
impl AuthSource for RoombookAuthSource {
    async fn get_password(&self, login: &LoginInfo) -> PgWireResult<Password> {
        validate_user(login.user())?;
        Ok(Password::new(None, self.password.as_bytes().to_vec()))
    }
}

fn validate_user(user: Option<&str>) -> PgWireResult<()> {
    let reason = match user {
        None | Some("") => "a user name is required",
        Some(u) if u.len() > MAX_CALLER_ID_LEN => "user name too long",
        Some(_) => return Ok(()),
    };
    metrics::counter!(crate::observability::AUTH_FAILURES_TOTAL).increment(1);
    tracing::warn!(user = user.unwrap_or_default(), "login rejected: {reason}");
    Err(PgWireError::UserError(Box::new(ErrorInfo::new(
        "FATAL".into(),
        "28000".into(),
        reason.into(),
    ))))
}

/// The authenticated caller of a connection.
pub fn caller_from_client<C: ClientInfo>(client: &C) -> PgWireResult<CallerId> {
    match client.metadata().get("user") {
        Some(user) if !user.is_empty() => Ok(CallerId::new(user.as_str())),
        _ => Err(PgWireError::UserError(Box::new(ErrorInfo::new(
            "ERROR".into(),
            "28000".into(),
            "connection has no authenticated user".into(),
        )))),
    }
}
