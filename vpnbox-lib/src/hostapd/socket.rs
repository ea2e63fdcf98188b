//! Datagram round-trips against the hostapd control socket.
//!
//! hostapd replies to the socket a request came from, so every query binds
//! a fresh randomly named local endpoint that is removed again on return.

use std::os::unix::net::UnixDatagram;
use std::path::Path;
use std::time::Duration;

use super::{ApStatus, Error};

const MAX_RESPONSE_SIZE: usize = 4096;
const READ_DEADLINE: Duration = Duration::from_millis(300);

/// Send `command` to the control socket at `socket_path` and return the raw
/// response. Blocking, bounded by the read deadline.
pub fn query(socket_path: &Path, command: &str) -> Result<Vec<u8>, Error> {
    let local = tempfile::Builder::new()
        .prefix("vpnbox-ctrl-")
        .make(|path| UnixDatagram::bind(path))?;

    let socket = local.as_file();
    socket.connect(socket_path)?;
    socket.set_read_timeout(Some(READ_DEADLINE))?;
    socket.send(command.as_bytes())?;

    let mut buf = [0u8; MAX_RESPONSE_SIZE];
    let n = socket.recv(&mut buf)?;
    Ok(buf[..n].to_vec())
}

/// `STATUS` round-trip, parsed.
pub fn query_status(socket_path: &Path) -> Result<ApStatus, Error> {
    let raw = query(socket_path, "STATUS")?;
    parse_status(&String::from_utf8_lossy(&raw))
}

fn parse_status(text: &str) -> Result<ApStatus, Error> {
    let mut state = None;
    let mut frequency = 0;
    let mut channel = 0;
    let mut stations_count = 0;

    for line in text.lines() {
        let Some((key, value)) = line.split_once('=') else {
            continue;
        };
        match key {
            "state" => state = Some(value.to_string()),
            "freq" => frequency = value.parse().unwrap_or(0),
            "channel" => channel = value.parse().unwrap_or(0),
            "num_sta[0]" => stations_count = value.parse().unwrap_or(0),
            _ => {}
        }
    }

    match state {
        Some(state) => Ok(ApStatus {
            state,
            frequency,
            channel,
            stations_count,
        }),
        None => Err(Error::UnexpectedResponse(text.to_string())),
    }
}
