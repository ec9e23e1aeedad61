//! Management TCP server (spec.md section 4.14): one blocking listener,
//! one thread per connection, each command framed as a `"RASCSI"` magic
//! followed by a little-endian `u32` length and a protobuf-encoded
//! `PbCommand`, answered the same way with a `PbResult`.

use crate::bus::Bus;
use crate::dispatcher::{Dispatcher, ShutdownRequest};
use crate::pb::PbCommand;
use std::io::{self, Read, Write};
use std::net::{TcpListener, TcpStream};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

const MAGIC: &[u8; 6] = b"RASCSI";
const MAX_FRAME_LEN: u32 = 64 * 1024 * 1024;

pub struct ManagementServer<B: Bus + Default + Send + 'static> {
    listener: TcpListener,
    dispatcher: Arc<Dispatcher<B>>,
    stopping: Arc<AtomicBool>,
}

impl<B: Bus + Default + Send + 'static> ManagementServer<B> {
    pub fn bind(addr: impl std::net::ToSocketAddrs, dispatcher: Arc<Dispatcher<B>>) -> io::Result<Self> {
        let listener = TcpListener::bind(addr)?;
        listener.set_nonblocking(true)?;
        Ok(Self { listener, dispatcher, stopping: Arc::new(AtomicBool::new(false)) })
    }

    pub fn local_addr(&self) -> io::Result<std::net::SocketAddr> {
        self.listener.local_addr()
    }

    /// A clone of the flag `run` polls between accept attempts.
    pub fn stop_handle(&self) -> Arc<AtomicBool> {
        Arc::clone(&self.stopping)
    }

    /// Accepts and fully serves one connection at a time until
    /// `stop_handle()` is set or a client requests a server-level shutdown
    /// (spec.md section 4.13's SHUT_DOWN, `"rascsi"` mode). Serving is
    /// strictly sequential, matching the synchronous blocking protocol
    /// spec.md section 4.14/6.1 describes -- a second client has to wait
    /// for the first to disconnect.
    pub fn run(&self) -> io::Result<Option<ShutdownRequest>> {
        loop {
            if self.stopping.load(Ordering::SeqCst) {
                return Ok(None);
            }
            let stream = match self.listener.accept() {
                Ok((stream, _)) => stream,
                Err(e) if e.kind() == io::ErrorKind::WouldBlock => {
                    std::thread::sleep(Duration::from_millis(50));
                    continue;
                }
                Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
                Err(e) => return Err(e),
            };
            stream.set_nonblocking(false)?;

            if let Some(request) = handle_connection(stream, &self.dispatcher) {
                self.stopping.store(true, Ordering::SeqCst);
                return Ok(Some(request));
            }
        }
    }
}

/// Serves every command sent over one connection until the client closes it
/// or a command schedules a shutdown, in which case that request is
/// returned so the caller can act on it after this connection's response
/// has been flushed.
fn handle_connection<B: Bus + Default + Send + 'static>(mut stream: TcpStream, dispatcher: &Dispatcher<B>) -> Option<ShutdownRequest> {
    let _ = stream.set_read_timeout(Some(Duration::from_secs(30)));
    let _ = stream.set_nodelay(true);

    loop {
        let command = match read_command(&mut stream) {
            Ok(Some(command)) => command,
            Ok(None) => return None,
            Err(_) => return None,
        };

        let (result, shutdown) = dispatcher.dispatch(&command);
        if write_result(&mut stream, &result).is_err() {
            return None;
        }
        if shutdown.is_some() {
            return shutdown;
        }
    }
}

fn read_command(stream: &mut TcpStream) -> io::Result<Option<PbCommand>> {
    let mut magic = [0u8; 6];
    if let Err(e) = stream.read_exact(&mut magic) {
        return if e.kind() == io::ErrorKind::UnexpectedEof { Ok(None) } else { Err(e) };
    }
    if &magic != MAGIC {
        return Err(io::Error::new(io::ErrorKind::InvalidData, "bad magic in management protocol handshake"));
    }

    let mut len_bytes = [0u8; 4];
    stream.read_exact(&mut len_bytes)?;
    let len = u32::from_le_bytes(len_bytes);
    if len > MAX_FRAME_LEN {
        return Err(io::Error::new(io::ErrorKind::InvalidData, "management frame too large"));
    }

    let mut payload = vec![0u8; len as usize];
    stream.read_exact(&mut payload)?;

    <PbCommand as prost::Message>::decode(payload.as_slice())
        .map(Some)
        .map_err(|e| io::Error::new(io::ErrorKind::InvalidData, e))
}

fn write_result(stream: &mut TcpStream, result: &crate::pb::PbResult) -> io::Result<()> {
    let mut payload = Vec::new();
    prost::Message::encode(result, &mut payload).map_err(|e| io::Error::new(io::ErrorKind::InvalidData, e))?;

    let mut frame = Vec::with_capacity(6 + 4 + payload.len());
    frame.extend_from_slice(MAGIC);
    frame.extend_from_slice(&(payload.len() as u32).to_le_bytes());
    frame.extend_from_slice(&payload);
    stream.write_all(&frame)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bus::LoopbackBus;
    use crate::executor::Executor;
    use crate::factory::ReservationRegistry;
    use crate::pb::PbOperation;
    use crate::properties::PropertyMap;
    use std::net::TcpStream as ClientStream;

    fn spawn_server() -> (Arc<AtomicBool>, std::net::SocketAddr, std::thread::JoinHandle<()>) {
        let registry = ReservationRegistry::new();
        let executor = Executor::<LoopbackBus>::new(registry, std::path::PathBuf::from("/tmp"));
        let dispatcher = Arc::new(Dispatcher::new(executor, PropertyMap::new(), String::new()));
        let server = ManagementServer::bind("127.0.0.1:0", dispatcher).unwrap();
        let addr = server.local_addr().unwrap();
        let stop = server.stop_handle();
        let handle = std::thread::spawn(move || {
            let _ = server.run();
        });
        (stop, addr, handle)
    }

    #[test]
    fn version_info_round_trips_over_the_wire() {
        let (stop, addr, handle) = spawn_server();
        let mut stream = ClientStream::connect(addr).unwrap();

        let command = PbCommand { operation: PbOperation::VersionInfo as i32, ..Default::default() };
        write_command(&mut stream, &command);
        let result = read_result(&mut stream);
        assert!(result.status);
        assert!(result.version_info.is_some());

        drop(stream);
        stop.store(true, Ordering::SeqCst);
        let _ = ClientStream::connect(addr);
        let _ = handle.join();
    }

    #[test]
    fn bad_magic_is_rejected() {
        let (stop, addr, handle) = spawn_server();
        let mut stream = ClientStream::connect(addr).unwrap();
        stream.write_all(b"BOGUS\0\0\0\0\0").ok();
        let mut buf = [0u8; 16];
        let n = stream.read(&mut buf).unwrap_or(0);
        assert_eq!(n, 0);

        stop.store(true, Ordering::SeqCst);
        let _ = ClientStream::connect(addr);
        let _ = handle.join();
    }

    #[test]
    fn shut_down_rascsi_mode_ends_the_accept_loop() {
        let registry = ReservationRegistry::new();
        let executor = Executor::<LoopbackBus>::new(registry, std::path::PathBuf::from("/tmp"));
        let dispatcher = Arc::new(Dispatcher::new(executor, PropertyMap::new(), String::new()));
        let server = ManagementServer::bind("127.0.0.1:0", dispatcher).unwrap();
        let addr = server.local_addr().unwrap();

        let handle = std::thread::spawn(move || server.run());

        let mut stream = ClientStream::connect(addr).unwrap();
        let mut params = std::collections::BTreeMap::new();
        params.insert("mode".to_string(), "rascsi".to_string());
        let command = PbCommand { operation: PbOperation::ShutDown as i32, params, ..Default::default() };
        write_command(&mut stream, &command);
        let result = read_result(&mut stream);
        assert!(result.status);
        drop(stream);

        let outcome = handle.join().unwrap().unwrap();
        assert_eq!(outcome, Some(ShutdownRequest::StopServer));
    }

    fn write_command(stream: &mut ClientStream, command: &PbCommand) {
        let mut payload = Vec::new();
        prost::Message::encode(command, &mut payload).unwrap();
        let mut frame = Vec::new();
        frame.extend_from_slice(MAGIC);
        frame.extend_from_slice(&(payload.len() as u32).to_le_bytes());
        frame.extend_from_slice(&payload);
        stream.write_all(&frame).unwrap();
    }

    fn read_result(stream: &mut ClientStream) -> crate::pb::PbResult {
        let mut magic = [0u8; 6];
        stream.read_exact(&mut magic).unwrap();
        assert_eq!(&magic, MAGIC);
        let mut len_bytes = [0u8; 4];
        stream.read_exact(&mut len_bytes).unwrap();
        let len = u32::from_le_bytes(len_bytes);
        let mut payload = vec![0u8; len as usize];
        stream.read_exact(&mut payload).unwrap();
        <crate::pb::PbResult as prost::Message>::decode(payload.as_slice()).unwrap()
    }
}
