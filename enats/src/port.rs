use crate::{Error, Result};
use log::debug;
use std::net::TcpListener;

/// Asks the OS for an unused local port by binding `127.0.0.1:0`
/// and immediately dropping the listener. Another process may grab
/// the port before the caller binds it; tests accept that window.
pub fn free_port() -> Result<u16> {
    let listener = TcpListener::bind(("127.0.0.1", 0)).map_err(Error::PortAllocation)?;
    let port = listener.local_addr().map_err(Error::PortAllocation)?.port();
    drop(listener);
    debug!("allocated free local port {}", port);
    Ok(port)
}
