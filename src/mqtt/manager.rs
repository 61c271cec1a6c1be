use super::config::MqttConfig;
use super::session::{ConnectionState, SessionHandle};
use super::SessionError;
use crate::command::IdentityProvider;
use tracing::{debug, info};

/// Owns at most one live session.
///
/// Logging in while a session is active tears the old one down first, so
/// nothing received for one identity ever lands in the next one's state.
pub struct SessionManager {
    config: MqttConfig,
    current: Option<SessionHandle>,
}

impl SessionManager {
    pub fn new(config: MqttConfig) -> Self {
        Self {
            config,
            current: None,
        }
    }

    pub fn config(&self) -> &MqttConfig {
        &self.config
    }

    pub async fn login(
        &mut self,
        identity: &dyn IdentityProvider,
        register_self: bool,
    ) -> Result<&SessionHandle, SessionError> {
        let identity = identity.identity()?;
        self.logout().await?;

        info!("Logging in user {}", identity.user_id());
        let handle = SessionHandle::spawn(identity, &self.config, register_self)?;
        Ok(self.current.insert(handle))
    }

    /// Ends the active session and discards its state. No-op when logged out.
    pub async fn logout(&mut self) -> Result<(), SessionError> {
        match self.current.take() {
            Some(mut handle) => {
                info!("Logging out user {}", handle.user_id());
                handle.shutdown().await?;
                Ok(())
            }
            None => {
                debug!("Logout without active session");
                Ok(())
            }
        }
    }

    pub fn session(&self) -> Result<&SessionHandle, SessionError> {
        self.current.as_ref().ok_or(SessionError::NotLoggedIn)
    }

    pub fn connection_state(&self) -> ConnectionState {
        self.current
            .as_ref()
            .map(SessionHandle::connection_state)
            .unwrap_or_default()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::command::{CommandError, Identity};
    use ed25519_dalek::SigningKey;

    struct FixedIdentity(&'static str);

    impl IdentityProvider for FixedIdentity {
        fn identity(&self) -> Result<Identity, CommandError> {
            Identity::new(self.0, SigningKey::from_bytes(&[3u8; 32]))
        }
    }

    fn unreachable_config() -> MqttConfig {
        let listener = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
        let port = listener.local_addr().unwrap().port();
        drop(listener);
        MqttConfig {
            port,
            ..MqttConfig::default()
        }
    }

    #[tokio::test]
    async fn test_logout_without_session() {
        let mut manager = SessionManager::new(MqttConfig::default());
        manager.logout().await.unwrap();
        manager.logout().await.unwrap();
        assert!(matches!(manager.session(), Err(SessionError::NotLoggedIn)));
        assert_eq!(manager.connection_state(), ConnectionState::Disconnected);
    }

    #[tokio::test]
    async fn test_login_replaces_previous_session() {
        let mut manager = SessionManager::new(unreachable_config());

        manager.login(&FixedIdentity("7"), false).await.unwrap();
        assert_eq!(manager.session().unwrap().user_id(), "7");

        manager.login(&FixedIdentity("8"), false).await.unwrap();
        let snapshot = manager.session().unwrap().snapshot().await;
        // the new session may already have failed to connect
        if let Ok(snapshot) = snapshot {
            assert_eq!(snapshot.user_id, "8");
            assert!(snapshot.devices.is_empty());
        }

        manager.logout().await.unwrap();
        assert!(manager.session().is_err());
    }

    #[tokio::test]
    async fn test_invalid_identity_keeps_current_session() {
        let mut manager = SessionManager::new(unreachable_config());
        manager.login(&FixedIdentity("7"), false).await.unwrap();

        let result = manager.login(&FixedIdentity("  "), false).await;
        assert!(matches!(result, Err(SessionError::Command(CommandError::EmptyUserId))));
        assert_eq!(manager.session().unwrap().user_id(), "7");
    }
}
