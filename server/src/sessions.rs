//! Client session tracking for the record service
//!
//! This module handles the server-side roster of known accounts and their
//! live sessions, including:
//! - Account registration and credential checks at login
//! - Session id assignment and lookup for request authorization
//! - Timeout and disconnect handling that severs a client's socket
//! - Ordered traversal so lookups behave deterministically
//!
//! The registry is fully serialized behind a single lock: every operation,
//! read or write, holds it for its whole duration. Simplicity and
//! correctness are preferred over read concurrency here; the roster is
//! small and the hot path is the object store, not this list.

use std::collections::VecDeque;
use std::net::{SocketAddr, TcpStream};

use log::info;
use parking_lot::Mutex;
use rand::Rng;
use shared::{CofferError, CofferResult, DEFAULT_SESSION_ID, MAX_SESSION_ID, MAX_USERNAME_LENGTH};

/// One known account and, when logged in, its live session state.
///
/// A session id of `DEFAULT_SESSION_ID` (zero) means "no session": the
/// account exists but nobody currently holds it. At most one live session
/// carries a given non-zero id at any time.
#[derive(Debug)]
pub struct Session {
    /// Account name, unique within the registry
    pub username: String,
    /// Login credential, compared verbatim
    pub password: String,
    /// Zero when unassigned, otherwise in `1..=MAX_SESSION_ID`
    pub session_id: u32,
    /// Access level granted to requests made under this session
    pub privilege: u8,
    /// Whether the account currently holds a live session
    pub logged_in: bool,
    /// Peer address of the connection that logged in, if any
    pub peer: Option<SocketAddr>,
    /// Owned clone of the client's stream, kept so a timeout sweep can
    /// sever the connection; `None` is the "no socket" state
    pub sock: Option<TcpStream>,
}

impl Session {
    /// Creates a logged-out session for a registered account.
    pub fn new(username: impl Into<String>, password: impl Into<String>, privilege: u8) -> Self {
        Self {
            username: username.into(),
            password: password.into(),
            session_id: DEFAULT_SESSION_ID,
            privilege,
            logged_in: false,
            peer: None,
            sock: None,
        }
    }
}

/// Owned snapshot of a session's public state, handed out by lookups so
/// callers never hold a reference into the locked roster.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SessionView {
    pub username: String,
    pub session_id: u32,
    pub privilege: u8,
    pub logged_in: bool,
}

impl SessionView {
    fn of(session: &Session) -> Self {
        Self {
            username: session.username.clone(),
            session_id: session.session_id,
            privilege: session.privilege,
            logged_in: session.logged_in,
        }
    }
}

/// Roster of every known account, in insertion order.
///
/// Lookups traverse front to back and the first match wins, so the
/// ordering operations (`enqueue`/`push`/`dequeue`/`pop`) are part of the
/// observable contract, not just plumbing.
pub struct SessionRegistry {
    sessions: Mutex<VecDeque<Session>>,
}

impl Default for SessionRegistry {
    fn default() -> Self {
        Self::new()
    }
}

impl SessionRegistry {
    pub fn new() -> Self {
        Self {
            sessions: Mutex::new(VecDeque::new()),
        }
    }

    /// Appends a session at the back of the roster.
    pub fn enqueue(&self, session: Session) {
        self.sessions.lock().push_back(session);
    }

    /// Inserts a session at the front of the roster.
    pub fn push(&self, session: Session) {
        self.sessions.lock().push_front(session);
    }

    /// Removes and returns the front session, if any.
    pub fn dequeue(&self) -> Option<Session> {
        self.sessions.lock().pop_front()
    }

    /// Alias of [`dequeue`](Self::dequeue); both ends of the stack/queue
    /// pairing remove from the front.
    pub fn pop(&self) -> Option<Session> {
        self.dequeue()
    }

    pub fn len(&self) -> usize {
        self.sessions.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.sessions.lock().is_empty()
    }

    /// Registers a new account, logged out and with no session id.
    ///
    /// Rejects empty or over-long usernames, empty passwords, and names
    /// already on the roster.
    pub fn add_account(
        &self,
        username: &str,
        password: &str,
        privilege: u8,
    ) -> CofferResult<()> {
        if username.is_empty() || username.len() > MAX_USERNAME_LENGTH {
            return Err(CofferError::InvalidArgument("username length out of range"));
        }
        if password.is_empty() {
            return Err(CofferError::InvalidArgument("password must not be empty"));
        }
        let mut sessions = self.sessions.lock();
        if sessions.iter().any(|s| s.username == username) {
            return Err(CofferError::InvalidArgument("username already registered"));
        }
        sessions.push_back(Session::new(username, password, privilege));
        info!("registered account {}", username);
        Ok(())
    }

    /// Exact-match search by username, front to back, first match wins.
    pub fn find_by_username(&self, username: &str) -> Option<SessionView> {
        self.sessions
            .lock()
            .iter()
            .find(|s| s.username == username)
            .map(SessionView::of)
    }

    /// Returns the privilege level of the session holding `session_id`.
    ///
    /// The id must be in `1..=MAX_SESSION_ID`; zero and out-of-range ids
    /// are invalid arguments, a valid id nobody holds is `NotFound`.
    pub fn find_by_session_id(&self, session_id: u32) -> CofferResult<u8> {
        if session_id == DEFAULT_SESSION_ID || session_id > MAX_SESSION_ID {
            return Err(CofferError::InvalidArgument("session id out of range"));
        }
        self.sessions
            .lock()
            .iter()
            .find(|s| s.session_id == session_id)
            .map(|s| s.privilege)
            .ok_or(CofferError::NotFound)
    }

    /// Owned copy of the username holding `session_id`, if anyone does.
    pub fn username_by_session(&self, session_id: u32) -> Option<String> {
        if session_id == DEFAULT_SESSION_ID || session_id > MAX_SESSION_ID {
            return None;
        }
        self.sessions
            .lock()
            .iter()
            .find(|s| s.session_id == session_id)
            .map(|s| s.username.clone())
    }

    /// Validates credentials and opens a session: assigns a fresh random
    /// session id unique among live sessions and attaches the connection.
    ///
    /// Logging in again over a new connection replaces the old session id
    /// and socket, so a stale entry never blocks the account.
    pub fn login(
        &self,
        username: &str,
        password: &str,
        stream: Option<TcpStream>,
    ) -> CofferResult<SessionView> {
        let mut sessions = self.sessions.lock();

        let in_use: Vec<u32> = sessions
            .iter()
            .filter(|s| s.session_id != DEFAULT_SESSION_ID)
            .map(|s| s.session_id)
            .collect();

        let session = sessions
            .iter_mut()
            .find(|s| s.username == username)
            .ok_or(CofferError::NotFound)?;
        if session.password != password {
            return Err(CofferError::InvalidArgument("invalid credentials"));
        }

        let mut rng = rand::thread_rng();
        let mut candidate = rng.gen_range(1..=MAX_SESSION_ID);
        while in_use.contains(&candidate) {
            candidate = rng.gen_range(1..=MAX_SESSION_ID);
        }

        session.session_id = candidate;
        session.logged_in = true;
        session.peer = stream.as_ref().and_then(|s| s.peer_addr().ok());
        session.sock = stream;

        info!("{} logged in with session {}", username, candidate);
        Ok(SessionView::of(session))
    }

    /// Ends the session holding `session_id`: clears the logged-in state,
    /// returns the id to "unassigned", and drops the attached socket.
    pub fn logout(&self, session_id: u32) -> CofferResult<()> {
        if session_id == DEFAULT_SESSION_ID || session_id > MAX_SESSION_ID {
            return Err(CofferError::InvalidArgument("session id out of range"));
        }
        let mut sessions = self.sessions.lock();
        let session = sessions
            .iter_mut()
            .find(|s| s.session_id == session_id)
            .ok_or(CofferError::NotFound)?;

        session.logged_in = false;
        session.session_id = DEFAULT_SESSION_ID;
        session.peer = None;
        session.sock = None;
        info!("{} logged out", session.username);
        Ok(())
    }

    /// Exact-match removal by username; the session and its socket are
    /// destroyed. A miss is a reported `NotFound`, not an error condition.
    pub fn delete_by_username(&self, username: &str) -> CofferResult<()> {
        let mut sessions = self.sessions.lock();
        let position = sessions
            .iter()
            .position(|s| s.username == username)
            .ok_or(CofferError::NotFound)?;
        sessions.remove(position);
        info!("deleted account {}", username);
        Ok(())
    }

    /// Invalidates the session attached to `peer` after an inactivity
    /// timeout: the client is logged out and its id returns to
    /// "unassigned", but the socket stays attached; timing out is not a
    /// disconnect.
    pub fn reset_timeout(&self, peer: SocketAddr) -> CofferResult<()> {
        let mut sessions = self.sessions.lock();
        let session = sessions
            .iter_mut()
            .find(|s| s.peer == Some(peer))
            .ok_or(CofferError::NotFound)?;

        session.logged_in = false;
        session.session_id = DEFAULT_SESSION_ID;
        info!("session for {} timed out", session.username);
        Ok(())
    }

    /// Severs the connection attached to `peer`: the owned stream is
    /// dropped (closing the descriptor) and the session is left in the
    /// "no socket" state. The session id survives; the client may still
    /// be within its timeout window.
    pub fn close_socket(&self, peer: SocketAddr) -> CofferResult<()> {
        let mut sessions = self.sessions.lock();
        let session = sessions
            .iter_mut()
            .find(|s| s.peer == Some(peer))
            .ok_or(CofferError::NotFound)?;

        session.sock = None;
        session.peer = None;
        Ok(())
    }
}
