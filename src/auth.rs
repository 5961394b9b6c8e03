use std::fmt::Debug;

use async_trait::async_trait;
use futures::Sink;
use pgwire::api::auth::cleartext::CleartextPasswordAuthStartupHandler;
use pgwire::api::auth::{
    AuthSource, DefaultServerParameterProvider, LoginInfo, Password, StartupHandler,
};
use pgwire::api::ClientInfo;
use pgwire::error::{PgWireError, PgWireResult};
use pgwire::messages::{PgWireBackendMessage, PgWireFrontendMessage};

/// One shared cleartext password for the whole server. The `user` startup
/// parameter is not part of authentication; it names the acting user.
#[derive(Debug)]
pub struct TurnosAuthSource {
    password: String,
}

impl TurnosAuthSource {
    pub fn new(password: String) -> Self {
        Self { password }
    }
}

#[async_trait]
impl AuthSource for TurnosAuthSource {
    async fn get_password(&self, _login: &LoginInfo) -> PgWireResult<Password> {
        Ok(Password::new(None, self.password.as_bytes().to_vec()))
    }
}

/// Cleartext startup with an auth-failure counter on top.
pub struct TurnosStartupHandler {
    inner: CleartextPasswordAuthStartupHandler<TurnosAuthSource, DefaultServerParameterProvider>,
}

impl TurnosStartupHandler {
    pub fn new(password: String) -> Self {
        Self {
            inner: CleartextPasswordAuthStartupHandler::new(
                TurnosAuthSource::new(password),
                DefaultServerParameterProvider::default(),
            ),
        }
    }
}

#[async_trait]
impl StartupHandler for TurnosStartupHandler {
    async fn on_startup<C>(
        &self,
        client: &mut C,
        message: PgWireFrontendMessage,
    ) -> PgWireResult<()>
    where
        C: ClientInfo + Sink<PgWireBackendMessage> + Unpin + Send + Sync,
        C::Error: Debug,
        PgWireError: From<C::Error>,
    {
        let result = self.inner.on_startup(client, message).await;
        // Password mismatches come back as 28P01 user errors, not a dedicated variant.
        if let Err(PgWireError::UserError(info)) = &result {
            if info.code == "28P01" {
                metrics::counter!(crate::observability::AUTH_FAILURES_TOTAL).increment(1);
            }
        }
        result
    }
}
