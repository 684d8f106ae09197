use topic_bus::Emitter;

use crate::auth::AuthClient;

#[derive(Clone)]
pub struct AppState {
    emitter: Emitter,
    auth: AuthClient,
}

impl AppState {
    pub fn new(emitter: Emitter, auth: AuthClient) -> Self {
        Self { emitter, auth }
    }

    pub fn emitter(&self) -> &Emitter {
        &self.emitter
    }

    pub fn auth(&self) -> &AuthClient {
        &self.auth
    }
}
