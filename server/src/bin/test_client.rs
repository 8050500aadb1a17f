use std::net::TcpStream;
use std::time::Duration;

use shared::{read_message, write_message, Request, Response};

/// Scripted smoke test against a running server: log in, store a record,
/// read it back, list keys, delete it, log out.
///
/// Expects the server to know the account used below, e.g.
/// `server --account tester:secret:5`.
fn main() -> Result<(), Box<dyn std::error::Error>> {
    let address = std::env::args()
        .nth(1)
        .unwrap_or_else(|| "127.0.0.1:7070".to_string());

    println!("Connecting to {}", address);
    let mut stream = TcpStream::connect(&address)?;
    stream.set_read_timeout(Some(Duration::from_secs(5)))?;

    // Log in
    write_message(
        &mut stream,
        &Request::Login {
            username: "tester".to_string(),
            password: "secret".to_string(),
        },
    )?;
    let session_id = match read_message::<Response>(&mut stream)? {
        Response::LoggedIn { session_id } => {
            println!("Logged in with session {}", session_id);
            session_id
        }
        other => {
            println!("Login refused: {:?}", other);
            return Ok(());
        }
    };

    // Store a record
    write_message(
        &mut stream,
        &Request::Put {
            session_id,
            key: "smoke-key".to_string(),
            value: b"smoke-value".to_vec(),
            permissions: 1,
        },
    )?;
    println!("Put response: {:?}", read_message::<Response>(&mut stream)?);

    // Read it back
    write_message(
        &mut stream,
        &Request::Get {
            session_id,
            key: "smoke-key".to_string(),
        },
    )?;
    match read_message::<Response>(&mut stream)? {
        Response::Found { record } => {
            println!(
                "Got record: key={} owner={} permissions={} value={:?}",
                record.key,
                record.owner,
                record.owner_permissions,
                String::from_utf8_lossy(&record.value)
            );
        }
        other => println!("Unexpected get response: {:?}", other),
    }

    // List visible keys
    write_message(&mut stream, &Request::Keys { session_id })?;
    match read_message::<Response>(&mut stream)? {
        Response::Keys { keys } => println!("Visible keys: {:?}", keys),
        other => println!("Unexpected keys response: {:?}", other),
    }

    // Clean up
    write_message(
        &mut stream,
        &Request::Delete {
            session_id,
            key: "smoke-key".to_string(),
        },
    )?;
    println!("Delete response: {:?}", read_message::<Response>(&mut stream)?);

    write_message(&mut stream, &Request::Logout { session_id })?;
    println!("Logout response: {:?}", read_message::<Response>(&mut stream)?);

    println!("Test client finished");
    Ok(())
}
