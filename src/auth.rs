use async_trait::async_trait;
use pgwire::api::auth::{AuthSource, LoginInfo, Password};
use pgwire::error::{ErrorInfo, PgWireError, PgWireResult};

/// Shared-secret cleartext auth. Identity proper belongs to the upstream auth
/// service; this only gates the socket and insists on a named actor, since
/// the login user is what gets stamped on every record.
#[derive(Debug)]
pub struct CrewPlanAuthSource {
    password: String,
}

impl CrewPlanAuthSource {
    pub fn new(password: String) -> Self {
        Self { password }
    }
}

#[async_trait]
impl AuthSource for CrewPlanAuthSource {
    async fn get_password(&self, login: &LoginInfo) -> PgWireResult<Password> {
        let actor = login.user().unwrap_or("").trim();
        if actor.is_empty() {
            tracing::warn!(host = %login.host(), "login without a user name");
            return Err(PgWireError::UserError(Box::new(ErrorInfo::new(
                "FATAL".into(),
                "28000".into(),
                "a user name is required".into(),
            ))));
        }
        tracing::debug!(actor, company = login.database().unwrap_or("default"), "login");
        Ok(Password::new(None, self.password.as_bytes().to_vec()))
    }
}
