//! Bearer-token sessions. Each session carries its own hypervisor connection,
//! built when the hypervisor accepted its credentials.

use serde::Serialize;
use std::collections::{BTreeMap, HashMap};
use std::fmt;
use parking_lot::Mutex;
use std::sync::Arc;
use time::OffsetDateTime;
use tracing::{info, warn};
use uuid::Uuid;

use crate::error::{GatewayError, GatewayResult};
use crate::hypervisor::{Hypervisor, HypervisorConnector};

pub const REDACTED: &str = "********";

/// Password kept in memory only; never printed.
#[derive(Clone)]
pub struct Password(#[allow(dead_code)] String);

impl fmt::Debug for Password {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(REDACTED)
    }
}

pub struct Session {
    pub id: u64,
    pub token: String,
    pub username: String,
    /// Credentials the hypervisor accepted at login. PVE tickets expire after
    /// two hours; the client built at login is used until then.
    // TODO: log in again with these credentials when a call fails on an expired ticket.
    #[allow(dead_code)]
    pub password: Password,
    pub created_at: OffsetDateTime,
    client: Arc<dyn Hypervisor>,
}

impl Session {
    pub fn client(&self) -> &dyn Hypervisor {
        self.client.as_ref()
    }

    pub fn view(&self) -> SessionView {
        SessionView {
            id: self.id,
            username: self.username.clone(),
            password: REDACTED.to_string(),
            created_at: self.created_at,
        }
    }
}

impl fmt::Debug for Session {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Session")
            .field("id", &self.id)
            .field("token", &token_hint(&self.token))
            .field("username", &self.username)
            .finish_non_exhaustive()
    }
}

/// Session as exposed to callers, password masked.
#[derive(Debug, Clone, Serialize)]
pub struct SessionView {
    pub id: u64,
    pub username: String,
    pub password: String,
    #[serde(with = "time::serde::rfc3339")]
    pub created_at: OffsetDateTime,
}

#[derive(Default)]
struct SessionTable {
    // ids grow with creation order, so this map is also the insertion order
    by_id: BTreeMap<u64, Arc<Session>>,
    tokens: HashMap<String, u64>,
    last_id: u64,
}

pub struct SessionStore {
    connector: Arc<dyn HypervisorConnector>,
    table: Mutex<SessionTable>,
}

impl SessionStore {
    pub fn new(connector: Arc<dyn HypervisorConnector>) -> Self {
        Self { connector, table: Mutex::new(SessionTable::default()) }
    }

    /// Validates the credentials against the hypervisor and opens a session.
    pub async fn create(&self, username: &str, password: &str) -> GatewayResult<Arc<Session>> {
        let client = self.connector.connect(username, password).await.map_err(|e| {
            warn!("hypervisor rejected credentials for {}: {}", username, e);
            GatewayError::Authentication(e.to_string())
        })?;

        let mut table = self.table.lock();
        let token = loop {
            let candidate = Uuid::new_v4().simple().to_string();
            if !table.tokens.contains_key(&candidate) {
                break candidate;
            }
        };
        table.last_id += 1;
        let session = Arc::new(Session {
            id: table.last_id,
            token: token.clone(),
            username: username.to_string(),
            password: Password(password.to_string()),
            created_at: OffsetDateTime::now_utc(),
            client,
        });
        table.tokens.insert(token, session.id);
        table.by_id.insert(session.id, session.clone());
        info!("session {} opened for {} (token {})", session.id, username, token_hint(&session.token));
        Ok(session)
    }

    pub fn validate(&self, token: &str) -> Option<Arc<Session>> {
        let table = self.table.lock();
        let id = table.tokens.get(token)?;
        table.by_id.get(id).cloned()
    }

    pub fn list_all(&self) -> Vec<SessionView> {
        self.table.lock().by_id.values().map(|s| s.view()).collect()
    }

    pub fn get_by_sequence_id(&self, id: u64) -> Option<Arc<Session>> {
        self.table.lock().by_id.get(&id).cloned()
    }

    pub fn delete(&self, id: u64) -> bool {
        let mut table = self.table.lock();
        match table.by_id.remove(&id) {
            Some(session) => {
                table.tokens.remove(&session.token);
                info!("session {} closed", id);
                true
            }
            None => false,
        }
    }

    #[cfg(test)]
    pub fn len(&self) -> usize {
        self.table.lock().by_id.len()
    }
}

/// First characters of a token, enough to correlate log lines.
pub fn token_hint(token: &str) -> String {
    format!("{}…", token.chars().take(8).collect::<String>())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::hypervisor::mock::{MockConnector, MockHypervisor};

    fn store() -> SessionStore {
        let connector = MockConnector::new(MockHypervisor::new())
            .accept("root@pam", "secret")
            .accept("ops@pve", "hunter2");
        SessionStore::new(Arc::new(connector))
    }

    #[tokio::test]
    async fn test_create_and_validate() {
        let store = store();
        let session = store.create("root@pam", "secret").await.unwrap();
        assert_eq!(session.id, 1);
        assert_eq!(session.token.len(), 32);
        assert!(session.token.chars().all(|c| c.is_ascii_hexdigit()));
        let found = store.validate(&session.token).unwrap();
        assert_eq!(found.username, "root@pam");
        assert_eq!(found.client().product_name(), "Proxmox VE 8.2.4");
    }

    #[tokio::test]
    async fn test_rejected_credentials() {
        let store = store();
        let err = store.create("root@pam", "wrong").await.unwrap_err();
        assert!(matches!(err, GatewayError::Authentication(msg) if msg == "authentication failure"));
        assert_eq!(store.len(), 0);
    }

    #[tokio::test]
    async fn test_ids_are_never_reused() {
        let store = store();
        let first = store.create("root@pam", "secret").await.unwrap();
        let second = store.create("ops@pve", "hunter2").await.unwrap();
        assert_ne!(first.token, second.token);
        assert!(store.delete(second.id));
        let third = store.create("root@pam", "secret").await.unwrap();
        assert_eq!(third.id, 3);
    }

    #[tokio::test]
    async fn test_validate_after_delete() {
        let store = store();
        let session = store.create("root@pam", "secret").await.unwrap();
        assert!(store.delete(session.id));
        assert!(store.validate(&session.token).is_none());
        assert!(!store.delete(session.id));
        assert!(store.get_by_sequence_id(session.id).is_none());
    }

    #[tokio::test]
    async fn test_list_is_redacted_and_ordered() {
        let store = store();
        store.create("root@pam", "secret").await.unwrap();
        store.create("ops@pve", "hunter2").await.unwrap();
        let views = store.list_all();
        assert_eq!(views.iter().map(|v| v.id).collect::<Vec<_>>(), vec![1, 2]);
        assert!(views.iter().all(|v| v.password == REDACTED));
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_concurrent_create_validate_delete() {
        use std::collections::HashSet;
        use tokio::task::JoinSet;

        const N: u64 = 50;
        let store = Arc::new(store());
        let mut set = JoinSet::new();
        for i in 0..N {
            let store = store.clone();
            set.spawn(async move {
                let session = store.create("root@pam", "secret").await.unwrap();
                assert!(store.validate(&session.token).is_some());
                // every third session is closed again right away
                let closed = i % 3 == 0;
                if closed {
                    assert!(store.delete(session.id));
                    assert!(store.validate(&session.token).is_none());
                }
                (session.id, session.token.clone(), closed)
            });
        }
        let mut results = Vec::new();
        while let Some(joined) = set.join_next().await {
            results.push(joined.unwrap());
        }

        let mut ids: Vec<u64> = results.iter().map(|(id, _, _)| *id).collect();
        ids.sort_unstable();
        assert_eq!(ids, (1..=N).collect::<Vec<_>>());

        let tokens: HashSet<&str> = results.iter().map(|(_, token, _)| token.as_str()).collect();
        assert_eq!(tokens.len(), N as usize);

        let live: Vec<u64> = store.list_all().iter().map(|v| v.id).collect();
        assert!(live.windows(2).all(|w| w[0] < w[1]));
        assert_eq!(live.len(), results.iter().filter(|(_, _, closed)| !closed).count());
        for (id, token, closed) in &results {
            assert_eq!(store.validate(token).is_some(), !closed, "session {id}");
        }
    }

    #[test]
    fn test_empty_store_validates_nothing() {
        assert!(store().validate("deadbeef").is_none());
    }

    #[tokio::test]
    async fn test_debug_never_prints_password() {
        let store = store();
        let session = store.create("root@pam", "secret").await.unwrap();
        let printed = format!("{:?} {:?}", session, session.password);
        assert!(!printed.contains("secret"));
        assert!(!printed.contains(&session.token));
    }
}
