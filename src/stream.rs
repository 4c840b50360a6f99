//! Single-in-flight command queue over a full duplex byte stream.
//!
//! A dedicated worker thread owns both stream halves after construction and is
//! the only thread touching them. Callers hand it one command at a time via
//! [StreamCommandQueue::send] and block until the adapter's response
//! terminator (`>` for ELM class adapters) shows up or the per command timeout
//! fires. The queue moves bytes and delimits frames, it never interprets
//! command semantics.

use std::io::{ErrorKind, Read, Write};
use std::sync::mpsc;
use std::thread::JoinHandle;
use std::time::{Duration, Instant};

use log::{debug, warn};

use crate::{TransportError, TransportResult};

/// Callback invoked with bytes that arrive while no command is active
pub type UnsolicitedHandler = Box<dyn FnMut(&[u8]) + Send>;

/// Response framing configuration
#[derive(Debug, Clone, Copy)]
pub struct QueueSettings {
    /// Byte which ends a response (the adapter's prompt)
    pub terminator: u8,
    /// Byte appended to every outgoing command line
    pub command_terminator: u8,
}

impl Default for QueueSettings {
    fn default() -> Self {
        Self {
            terminator: b'>',
            command_terminator: b'\r',
        }
    }
}

enum QueueRequest {
    Send {
        line: String,
        timeout: Duration,
        resp: mpsc::Sender<TransportResult<String>>,
    },
    SetUnsolicitedHandler(UnsolicitedHandler),
    Shutdown,
}

struct ActiveCommand {
    resp: mpsc::Sender<TransportResult<String>>,
    deadline: Instant,
}

/// Single-in-flight request/response queue over an input/output stream pair.
///
/// The input stream must block for a short interval before returning
/// [ErrorKind::TimedOut]/[ErrorKind::WouldBlock] when no data is available
/// (a serial port opened with a read timeout of a few milliseconds does
/// exactly that), otherwise the worker cannot interleave reads with request
/// handling.
///
/// [StreamCommandQueue::shutdown] (or dropping the queue) is required for
/// clean termination, it stops and joins the worker.
#[derive(Debug)]
pub struct StreamCommandQueue {
    request_tx: mpsc::Sender<QueueRequest>,
    handle: Option<JoinHandle<()>>,
}

impl StreamCommandQueue {
    /// Creates the queue and hands both streams to a new worker thread
    pub fn new<R, W>(input: R, output: W, settings: QueueSettings) -> Self
    where
        R: Read + Send + 'static,
        W: Write + Send + 'static,
    {
        let (request_tx, request_rx) = mpsc::channel::<QueueRequest>();
        let handle = std::thread::spawn(move || worker(input, output, settings, request_rx));
        Self {
            request_tx,
            handle: Some(handle),
        }
    }

    /// Opens a serial port with an 10ms read timeout and runs the queue over it
    #[cfg(feature = "serialport")]
    pub fn open_port(path: &str, baud: u32, settings: QueueSettings) -> TransportResult<Self> {
        let port = serialport::new(path, baud)
            .timeout(Duration::from_millis(10))
            .open()
            .map_err(|e| TransportError::Communication(e.to_string()))?;
        let input = port
            .try_clone()
            .map_err(|e| TransportError::Communication(e.to_string()))?;
        Ok(Self::new(input, port, settings))
    }

    /// Sends one command line and waits for the terminated response.
    ///
    /// At most one command may be outstanding; issuing a second one while the
    /// first is in flight is a caller bug and fails with
    /// [TransportError::UnexpectedResult].
    pub fn send(&self, command: &str, timeout: Duration) -> TransportResult<String> {
        let (resp_tx, resp_rx) = mpsc::channel();
        self.request_tx
            .send(QueueRequest::Send {
                line: command.to_string(),
                timeout,
                resp: resp_tx,
            })
            .map_err(|_| TransportError::Shutdown)?;
        resp_rx.recv().map_err(|_| TransportError::Shutdown)?
    }

    /// Installs a callback for bytes arriving while no command is active
    pub fn set_unsolicited_handler<F: FnMut(&[u8]) + Send + 'static>(&self, handler: F) {
        let _ = self
            .request_tx
            .send(QueueRequest::SetUnsolicitedHandler(Box::new(handler)));
    }

    /// Stops the worker, failing any active command with [TransportError::Shutdown]
    pub fn shutdown(&mut self) {
        let _ = self.request_tx.send(QueueRequest::Shutdown);
        if let Some(handle) = self.handle.take() {
            let _ = handle.join();
        }
    }
}

impl Drop for StreamCommandQueue {
    fn drop(&mut self) {
        self.shutdown();
    }
}

fn worker<R: Read, W: Write>(
    mut input: R,
    mut output: W,
    settings: QueueSettings,
    request_rx: mpsc::Receiver<QueueRequest>,
) {
    let mut active: Option<ActiveCommand> = None;
    let mut buffer: Vec<u8> = Vec::new();
    let mut unsolicited: Option<UnsolicitedHandler> = None;
    let mut stream_dead: Option<TransportError> = None;
    let mut read_chunk = [0u8; 256];

    loop {
        match request_rx.try_recv() {
            Ok(QueueRequest::Send { line, timeout, resp }) => {
                debug_assert!(active.is_none(), "send() while a command is in flight");
                if active.is_some() {
                    let _ = resp.send(Err(TransportError::UnexpectedResult(
                        "a command is already in flight".into(),
                    )));
                } else if let Some(err) = &stream_dead {
                    let _ = resp.send(Err(err.clone()));
                } else {
                    debug!("TX: {line:?}");
                    let written = output
                        .write_all(line.as_bytes())
                        .and_then(|_| output.write_all(&[settings.command_terminator]))
                        .and_then(|_| output.flush());
                    match written {
                        // Timeout arms once the write has completed
                        Ok(()) => {
                            buffer.clear();
                            active = Some(ActiveCommand {
                                resp,
                                deadline: Instant::now() + timeout,
                            });
                        }
                        Err(e) => {
                            let _ = resp.send(Err(TransportError::Communication(e.to_string())));
                        }
                    }
                }
            }
            Ok(QueueRequest::SetUnsolicitedHandler(handler)) => unsolicited = Some(handler),
            Ok(QueueRequest::Shutdown) | Err(mpsc::TryRecvError::Disconnected) => {
                if let Some(cmd) = active.take() {
                    let _ = cmd.resp.send(Err(TransportError::Shutdown));
                }
                return;
            }
            Err(mpsc::TryRecvError::Empty) => {}
        }

        if stream_dead.is_none() {
            match input.read(&mut read_chunk) {
                Ok(0) => {
                    let err = TransportError::Communication("end of stream".into());
                    if let Some(cmd) = active.take() {
                        let _ = cmd.resp.send(Err(err.clone()));
                    }
                    stream_dead = Some(err);
                }
                Ok(n) => {
                    let chunk = &read_chunk[..n];
                    if active.is_some() {
                        buffer.extend_from_slice(chunk);
                        if let Some(response) = extract_response(&buffer, settings.terminator) {
                            debug!("RX: {response:?}");
                            let cmd = active.take().unwrap();
                            buffer.clear();
                            if cmd.resp.send(response).is_err() {
                                // Caller gave up waiting (host side cancellation)
                                warn!("response arrived after the waiter went away, discarding");
                            }
                        }
                    } else if let Some(handler) = unsolicited.as_mut() {
                        debug!("unsolicited RX: {chunk:02X?}");
                        handler(chunk);
                    }
                }
                Err(e)
                    if matches!(
                        e.kind(),
                        ErrorKind::TimedOut | ErrorKind::WouldBlock | ErrorKind::Interrupted
                    ) => {}
                Err(e) => {
                    let err = TransportError::Communication(e.to_string());
                    if let Some(cmd) = active.take() {
                        let _ = cmd.resp.send(Err(err.clone()));
                    }
                    stream_dead = Some(err);
                }
            }
        } else {
            std::thread::sleep(Duration::from_millis(5));
        }

        if let Some(cmd) = &active {
            if Instant::now() >= cmd.deadline {
                warn!("command timed out, {} bytes buffered", buffer.len());
                let _ = active.take().unwrap().resp.send(Err(TransportError::Timeout));
                buffer.clear();
            }
        }
    }
}

// Everything before the last terminator is the response; trailing terminator
// bytes and line breaks are stripped.
fn extract_response(buffer: &[u8], terminator: u8) -> Option<TransportResult<String>> {
    let last = buffer.iter().rposition(|b| *b == terminator)?;
    let mut end = last;
    while end > 0 && buffer[end - 1] == terminator {
        end -= 1;
    }
    let raw = &buffer[..end];
    if !raw.is_ascii() {
        return Some(Err(TransportError::InvalidCharacters));
    }
    let text = String::from_utf8_lossy(raw)
        .trim_matches(['\r', '\n', ' '])
        .to_string();
    Some(Ok(text))
}

#[cfg(test)]
mod test {
    use super::*;
    use std::collections::VecDeque;
    use std::sync::{Arc, Mutex};

    /// Byte queue readable end. Blocks briefly and reports TimedOut when empty,
    /// reports end-of-stream once `eof` is set and the queue drained.
    #[derive(Clone)]
    struct PipeReader {
        data: Arc<Mutex<VecDeque<u8>>>,
        eof: Arc<Mutex<bool>>,
    }

    impl Read for PipeReader {
        fn read(&mut self, buf: &mut [u8]) -> std::io::Result<usize> {
            let mut queue = self.data.lock().unwrap();
            if queue.is_empty() {
                if *self.eof.lock().unwrap() {
                    return Ok(0);
                }
                drop(queue);
                std::thread::sleep(Duration::from_millis(1));
                return Err(std::io::Error::new(ErrorKind::TimedOut, "no data"));
            }
            let mut n = 0;
            while n < buf.len() {
                match queue.pop_front() {
                    Some(b) => {
                        buf[n] = b;
                        n += 1;
                    }
                    None => break,
                }
            }
            Ok(n)
        }
    }

    #[derive(Clone)]
    struct PipeWriter {
        written: Arc<Mutex<Vec<u8>>>,
    }

    impl Write for PipeWriter {
        fn write(&mut self, buf: &[u8]) -> std::io::Result<usize> {
            self.written.lock().unwrap().extend_from_slice(buf);
            Ok(buf.len())
        }
        fn flush(&mut self) -> std::io::Result<()> {
            Ok(())
        }
    }

    fn pipe() -> (PipeReader, PipeWriter, Arc<Mutex<VecDeque<u8>>>, Arc<Mutex<Vec<u8>>>) {
        let data = Arc::new(Mutex::new(VecDeque::new()));
        let eof = Arc::new(Mutex::new(false));
        let written = Arc::new(Mutex::new(Vec::new()));
        (
            PipeReader {
                data: data.clone(),
                eof,
            },
            PipeWriter {
                written: written.clone(),
            },
            data,
            written,
        )
    }

    fn push(data: &Arc<Mutex<VecDeque<u8>>>, bytes: &[u8]) {
        data.lock().unwrap().extend(bytes.iter().copied());
    }

    #[test]
    fn command_roundtrip() {
        let (reader, writer, data, written) = pipe();
        let queue = StreamCommandQueue::new(reader, writer, QueueSettings::default());
        let feeder = data.clone();
        let handle = std::thread::spawn(move || {
            std::thread::sleep(Duration::from_millis(20));
            push(&feeder, b"\r\rELM327 v1.5\r\r>");
        });
        let response = queue.send("ATI", Duration::from_secs(1)).unwrap();
        assert_eq!(response, "ELM327 v1.5");
        assert_eq!(written.lock().unwrap().as_slice(), b"ATI\r".as_slice());
        handle.join().unwrap();
    }

    #[test]
    fn timeout_frees_the_queue() {
        let (reader, writer, data, _) = pipe();
        let queue = StreamCommandQueue::new(reader, writer, QueueSettings::default());
        let started = Instant::now();
        let err = queue.send("0100", Duration::from_millis(50)).unwrap_err();
        assert_eq!(err, TransportError::Timeout);
        assert!(started.elapsed() >= Duration::from_millis(50));

        // Queue accepts the next command right away
        let feeder = data.clone();
        std::thread::spawn(move || {
            std::thread::sleep(Duration::from_millis(10));
            push(&feeder, b"OK\r>");
        });
        assert_eq!(queue.send("ATE0", Duration::from_secs(1)).unwrap(), "OK");
    }

    #[test]
    fn response_is_cut_at_the_last_terminator() {
        assert_eq!(
            extract_response(b"SEARCHING...\r41 00 BE 1F B8 10\r\r>", b'>')
                .unwrap()
                .unwrap(),
            "SEARCHING...\r41 00 BE 1F B8 10"
        );
        assert_eq!(extract_response(b"OK\r>>", b'>').unwrap().unwrap(), "OK");
        assert!(extract_response(b"no prompt yet", b'>').is_none());
        assert_eq!(
            extract_response(&[0x41, 0xFF, b'>'], b'>').unwrap(),
            Err(TransportError::InvalidCharacters)
        );
    }

    #[test]
    fn unsolicited_bytes_reach_the_handler() {
        let (reader, writer, data, _) = pipe();
        let queue = StreamCommandQueue::new(reader, writer, QueueSettings::default());
        let (tx, rx) = mpsc::channel();
        queue.set_unsolicited_handler(move |bytes| {
            let _ = tx.send(bytes.to_vec());
        });
        std::thread::sleep(Duration::from_millis(10));
        push(&data, b"ACT ALERT\r");
        let received = rx.recv_timeout(Duration::from_secs(1)).unwrap();
        assert_eq!(received, b"ACT ALERT\r");
    }

    #[test]
    fn end_of_stream_fails_the_active_command() {
        let (reader, writer, data, _) = pipe();
        let eof = reader.eof.clone();
        let queue = StreamCommandQueue::new(reader, writer, QueueSettings::default());
        let feeder = data.clone();
        std::thread::spawn(move || {
            std::thread::sleep(Duration::from_millis(10));
            push(&feeder, b"partial");
            *eof.lock().unwrap() = true;
        });
        let err = queue.send("ATI", Duration::from_secs(2)).unwrap_err();
        assert!(matches!(err, TransportError::Communication(_)));
        // And every later command fails fast
        let err = queue.send("ATI", Duration::from_secs(2)).unwrap_err();
        assert!(matches!(err, TransportError::Communication(_)));
    }

    #[test]
    fn shutdown_releases_the_waiter() {
        let (reader, writer, _, _) = pipe();
        let mut queue = StreamCommandQueue::new(reader, writer, QueueSettings::default());
        let request_tx = queue.request_tx.clone();
        let waiter = std::thread::spawn(move || {
            let (resp_tx, resp_rx) = mpsc::channel();
            request_tx
                .send(QueueRequest::Send {
                    line: "ATI".into(),
                    timeout: Duration::from_secs(30),
                    resp: resp_tx,
                })
                .unwrap();
            resp_rx.recv().unwrap()
        });
        std::thread::sleep(Duration::from_millis(20));
        queue.shutdown();
        assert_eq!(waiter.join().unwrap(), Err(TransportError::Shutdown));
    }
}
