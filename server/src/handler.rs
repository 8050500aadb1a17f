//! Per-connection request handling
//!
//! Workers hand each claimed stream to [`ServiceHandler`], which speaks the
//! length-prefixed packet protocol from `shared`: read one `Request`,
//! consult the session registry and object store, write one `Response`,
//! repeat until the client disconnects. Protocol errors are localized to
//! the connection: a malformed packet closes that client and nothing else.

use std::io::ErrorKind;
use std::net::{SocketAddr, TcpStream};
use std::sync::Arc;
use std::time::Duration;

use log::{debug, info, warn};
use shared::{read_message, write_message, Record, Request, Response};

use crate::dispatch::ConnectionHandler;
use crate::sessions::SessionRegistry;
use crate::store::ObjectStore;

/// How long a connection may sit idle before the handler gives up on it.
const IDLE_TIMEOUT: Duration = Duration::from_secs(300);

pub struct ServiceHandler {
    store: Arc<ObjectStore>,
    registry: Arc<SessionRegistry>,
}

impl ServiceHandler {
    pub fn new(store: Arc<ObjectStore>, registry: Arc<SessionRegistry>) -> Self {
        Self { store, registry }
    }

    /// Resolves a session id to the requesting account and its privilege.
    fn authorize(&self, session_id: u32) -> Result<(String, u8), Response> {
        let privilege = self
            .registry
            .find_by_session_id(session_id)
            .map_err(|_| Response::Error {
                reason: "invalid session".to_string(),
            })?;
        let username = self
            .registry
            .username_by_session(session_id)
            .ok_or(Response::Error {
                reason: "invalid session".to_string(),
            })?;
        Ok((username, privilege))
    }

    /// A record is visible to its owner and to any session whose privilege
    /// reaches the record's access level.
    fn visible(record: &Record, username: &str, privilege: u8) -> bool {
        record.owner == username || privilege >= record.owner_permissions
    }

    /// Maps one request to its response. `stream` carries the connection
    /// being served so a successful login can attach it to the session.
    pub fn process(&self, request: Request, stream: Option<&TcpStream>) -> Response {
        match request {
            Request::Login { username, password } => {
                let clone = stream.and_then(|s| s.try_clone().ok());
                match self.registry.login(&username, &password, clone) {
                    Ok(view) => Response::LoggedIn {
                        session_id: view.session_id,
                    },
                    Err(e) => {
                        warn!("login failed for {}: {}", username, e);
                        Response::Error {
                            reason: "login failed".to_string(),
                        }
                    }
                }
            }
            Request::Logout { session_id } => match self.registry.logout(session_id) {
                Ok(()) => Response::LoggedOut,
                Err(_) => Response::Error {
                    reason: "invalid session".to_string(),
                },
            },
            Request::Put {
                session_id,
                key,
                value,
                permissions,
            } => {
                let (username, _) = match self.authorize(session_id) {
                    Ok(who) => who,
                    Err(denied) => return denied,
                };
                let record = Record::new(key, value, username, permissions);
                match self.store.insert(record) {
                    // Re-inserting an existing key is a success that changes
                    // nothing; the client sees Stored either way.
                    Ok(_) => Response::Stored,
                    Err(e) => Response::Error {
                        reason: e.to_string(),
                    },
                }
            }
            Request::Get { session_id, key } => {
                let (username, privilege) = match self.authorize(session_id) {
                    Ok(who) => who,
                    Err(denied) => return denied,
                };
                match self.store.get(&key) {
                    Some(record) if Self::visible(&record, &username, privilege) => {
                        Response::Found { record }
                    }
                    _ => Response::Error {
                        reason: "not found".to_string(),
                    },
                }
            }
            Request::Delete { session_id, key } => {
                let (username, privilege) = match self.authorize(session_id) {
                    Ok(who) => who,
                    Err(denied) => return denied,
                };
                match self.store.get(&key) {
                    Some(record) if Self::visible(&record, &username, privilege) => {
                        // The removed record is owned here and dropped; the
                        // store no longer holds it.
                        self.store.remove(&key);
                        Response::Deleted
                    }
                    _ => Response::Error {
                        reason: "not found".to_string(),
                    },
                }
            }
            Request::Keys { session_id } => {
                let (username, privilege) = match self.authorize(session_id) {
                    Ok(who) => who,
                    Err(denied) => return denied,
                };
                let keys = self
                    .store
                    .keys_matching(|_, record| Self::visible(record, &username, privilege));
                Response::Keys { keys }
            }
            Request::Search {
                session_id,
                pattern,
            } => {
                let (username, privilege) = match self.authorize(session_id) {
                    Ok(who) => who,
                    Err(denied) => return denied,
                };
                let keys = self.store.keys_matching(|key, record| {
                    key.contains(&pattern) && Self::visible(record, &username, privilege)
                });
                Response::Keys { keys }
            }
        }
    }
}

impl ConnectionHandler for ServiceHandler {
    fn handle(&self, mut stream: TcpStream, peer: SocketAddr) {
        info!("serving connection from {}", peer);
        if let Err(e) = stream.set_read_timeout(Some(IDLE_TIMEOUT)) {
            warn!("could not set read timeout for {}: {}", peer, e);
        }

        loop {
            let request: Request = match read_message(&mut stream) {
                Ok(request) => request,
                Err(e) if e.kind() == ErrorKind::UnexpectedEof => {
                    debug!("{} disconnected", peer);
                    break;
                }
                Err(e) => {
                    warn!("dropping {}: {}", peer, e);
                    break;
                }
            };

            let response = self.process(request, Some(&stream));
            if let Err(e) = write_message(&mut stream, &response) {
                warn!("failed to respond to {}: {}", peer, e);
                break;
            }
        }

        // Forget the registry's clone of this connection; a miss just means
        // the client never logged in.
        let _ = self.registry.close_socket(peer);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::sessions::SessionRegistry;
    use crate::store::ObjectStore;

    fn handler_with_account(name: &str, privilege: u8) -> (ServiceHandler, u32) {
        let store = Arc::new(ObjectStore::new(64).unwrap());
        let registry = Arc::new(SessionRegistry::new());
        registry.add_account(name, "pw", privilege).unwrap();
        let session_id = registry.login(name, "pw", None).unwrap().session_id;
        (ServiceHandler::new(store, registry), session_id)
    }

    fn put(handler: &ServiceHandler, session_id: u32, key: &str, permissions: u8) {
        let response = handler.process(
            Request::Put {
                session_id,
                key: key.to_string(),
                value: b"v".to_vec(),
                permissions,
            },
            None,
        );
        assert!(matches!(response, Response::Stored));
    }

    #[test]
    fn test_login_then_get_roundtrip() {
        let (handler, session_id) = handler_with_account("alice", 1);
        put(&handler, session_id, "k1", 0);

        match handler.process(
            Request::Get {
                session_id,
                key: "k1".to_string(),
            },
            None,
        ) {
            Response::Found { record } => {
                assert_eq!(record.owner, "alice");
                assert_eq!(record.value, b"v");
            }
            other => panic!("unexpected response: {other:?}"),
        }
    }

    #[test]
    fn test_rejects_unknown_session() {
        let (handler, _) = handler_with_account("alice", 1);
        let response = handler.process(
            Request::Get {
                session_id: 12345,
                key: "k1".to_string(),
            },
            None,
        );
        assert!(matches!(response, Response::Error { .. }));
    }

    #[test]
    fn test_rejects_bad_login() {
        let (handler, _) = handler_with_account("alice", 1);
        let response = handler.process(
            Request::Login {
                username: "alice".to_string(),
                password: "wrong".to_string(),
            },
            None,
        );
        assert!(matches!(response, Response::Error { .. }));
    }

    #[test]
    fn test_permission_gate_on_get() {
        let store = Arc::new(ObjectStore::new(64).unwrap());
        let registry = Arc::new(SessionRegistry::new());
        registry.add_account("owner", "pw", 1).unwrap();
        registry.add_account("low", "pw", 1).unwrap();
        registry.add_account("high", "pw", 9).unwrap();
        let handler = ServiceHandler::new(store, Arc::clone(&registry));

        let owner = registry.login("owner", "pw", None).unwrap().session_id;
        let low = registry.login("low", "pw", None).unwrap().session_id;
        let high = registry.login("high", "pw", None).unwrap().session_id;

        put(&handler, owner, "secret", 5);

        // The owner always sees their record, a low-privilege stranger does
        // not, a high-privilege one does.
        let get = |session_id| {
            handler.process(
                Request::Get {
                    session_id,
                    key: "secret".to_string(),
                },
                None,
            )
        };
        assert!(matches!(get(owner), Response::Found { .. }));
        assert!(matches!(get(low), Response::Error { .. }));
        assert!(matches!(get(high), Response::Found { .. }));
    }

    #[test]
    fn test_delete_respects_visibility() {
        let store = Arc::new(ObjectStore::new(64).unwrap());
        let registry = Arc::new(SessionRegistry::new());
        registry.add_account("owner", "pw", 1).unwrap();
        registry.add_account("stranger", "pw", 0).unwrap();
        let handler = ServiceHandler::new(Arc::clone(&store), Arc::clone(&registry));

        let owner = registry.login("owner", "pw", None).unwrap().session_id;
        let stranger = registry.login("stranger", "pw", None).unwrap().session_id;

        put(&handler, owner, "k1", 5);

        let denied = handler.process(
            Request::Delete {
                session_id: stranger,
                key: "k1".to_string(),
            },
            None,
        );
        assert!(matches!(denied, Response::Error { .. }));
        assert_eq!(store.len(), 1);

        let allowed = handler.process(
            Request::Delete {
                session_id: owner,
                key: "k1".to_string(),
            },
            None,
        );
        assert!(matches!(allowed, Response::Deleted));
        assert!(store.is_empty());
    }

    #[test]
    fn test_keys_and_search_filter_by_visibility() {
        let store = Arc::new(ObjectStore::new(64).unwrap());
        let registry = Arc::new(SessionRegistry::new());
        registry.add_account("alice", "pw", 0).unwrap();
        registry.add_account("bob", "pw", 0).unwrap();
        let handler = ServiceHandler::new(store, Arc::clone(&registry));

        let alice = registry.login("alice", "pw", None).unwrap().session_id;
        let bob = registry.login("bob", "pw", None).unwrap().session_id;

        put(&handler, alice, "alpha-one", 5);
        put(&handler, alice, "alpha-two", 0);
        put(&handler, bob, "beta-one", 5);

        match handler.process(Request::Keys { session_id: bob }, None) {
            Response::Keys { mut keys } => {
                keys.sort();
                // bob owns beta-one and may read the open alpha-two, but not
                // the protected alpha-one.
                assert_eq!(keys, vec!["alpha-two", "beta-one"]);
            }
            other => panic!("unexpected response: {other:?}"),
        }

        match handler.process(
            Request::Search {
                session_id: bob,
                pattern: "alpha".to_string(),
            },
            None,
        ) {
            Response::Keys { keys } => assert_eq!(keys, vec!["alpha-two"]),
            other => panic!("unexpected response: {other:?}"),
        }
    }

    #[test]
    fn test_reinsert_reports_stored_and_keeps_original() {
        let store = Arc::new(ObjectStore::new(64).unwrap());
        let registry = Arc::new(SessionRegistry::new());
        registry.add_account("alice", "pw", 0).unwrap();
        let handler = ServiceHandler::new(Arc::clone(&store), Arc::clone(&registry));
        let alice = registry.login("alice", "pw", None).unwrap().session_id;

        put(&handler, alice, "k1", 0);
        let again = handler.process(
            Request::Put {
                session_id: alice,
                key: "k1".to_string(),
                value: b"other".to_vec(),
                permissions: 7,
            },
            None,
        );
        assert!(matches!(again, Response::Stored));
        assert_eq!(store.get("k1").unwrap().value, b"v");
        assert_eq!(store.len(), 1);
    }

    #[test]
    fn test_logout_invalidates_session() {
        let (handler, session_id) = handler_with_account("alice", 1);
        assert!(matches!(
            handler.process(Request::Logout { session_id }, None),
            Response::LoggedOut
        ));
        let response = handler.process(Request::Keys { session_id }, None);
        assert!(matches!(response, Response::Error { .. }));
    }
}
