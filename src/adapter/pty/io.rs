//! Blocking PTY I/O bridged onto the session pipeline.
//!
//! portable-pty hands out blocking `Read`/`Write` handles. Each pump runs
//! its loop on a `spawn_blocking` thread so the runtime never stalls on a
//! terminal read.

use std::io::{Read, Write};

use tokio::sync::mpsc;
use tracing::{debug, error, trace};

use crate::adapter::EventSink;
use crate::event::{NewEvent, CHANNEL_PTY_STDOUT, TYPE_OUTPUT};

const READ_BUFFER_SIZE: usize = 4096;

/// Reads terminal output and emits it as `pty:stdout` events.
///
/// Sending uses `blocking_send`, so a pipeline that falls behind slows the
/// reader down instead of buffering without bound.
pub struct OutputPump<R: Read + Send + 'static> {
    reader: R,
    sink: EventSink,
    buffer_size: usize,
}

impl<R: Read + Send + 'static> OutputPump<R> {
    pub fn new(reader: R, sink: EventSink) -> Self {
        Self {
            reader,
            sink,
            buffer_size: READ_BUFFER_SIZE,
        }
    }

    #[cfg(test)]
    fn with_buffer_size(mut self, size: usize) -> Self {
        self.buffer_size = size;
        self
    }

    /// Pump until EOF, a closed terminal, or a dropped pipeline.
    pub async fn run(self) {
        let Self {
            mut reader,
            sink,
            buffer_size,
        } = self;

        let result = tokio::task::spawn_blocking(move || {
            let mut buf = vec![0u8; buffer_size];

            loop {
                match reader.read(&mut buf) {
                    Ok(0) => {
                        debug!(session_id = %sink.session_id(), "PTY reader: EOF");
                        break;
                    }
                    Ok(n) => {
                        trace!(session_id = %sink.session_id(), bytes = n, "PTY reader: read");
                        let event = NewEvent::new(CHANNEL_PTY_STDOUT, TYPE_OUTPUT, buf[..n].to_vec());
                        if !sink.emit_blocking(event) {
                            break;
                        }
                    }
                    Err(e) if e.kind() == std::io::ErrorKind::Interrupted => continue,
                    Err(e) => {
                        // EIO on Unix means the slave side is gone
                        #[cfg(unix)]
                        if e.raw_os_error() == Some(libc::EIO) {
                            debug!(session_id = %sink.session_id(), "PTY reader: PTY closed (EIO)");
                            break;
                        }

                        if e.kind() == std::io::ErrorKind::BrokenPipe {
                            debug!(session_id = %sink.session_id(), "PTY reader: broken pipe");
                            break;
                        }

                        error!(session_id = %sink.session_id(), "PTY reader error: {}", e);
                        break;
                    }
                }
            }
        })
        .await;

        if let Err(e) = result {
            error!("PTY reader task panicked: {}", e);
        }
    }
}

/// Writes client input to the terminal.
pub struct InputPump<W: Write + Send + 'static> {
    writer: W,
    rx: mpsc::Receiver<Vec<u8>>,
}

impl<W: Write + Send + 'static> InputPump<W> {
    pub fn new(writer: W, rx: mpsc::Receiver<Vec<u8>>) -> Self {
        Self { writer, rx }
    }

    /// Pump until every sender is dropped or the terminal rejects a write.
    ///
    /// Returns the writer so callers (and tests) can inspect it.
    pub async fn run(self) -> Option<W> {
        let Self { mut writer, mut rx } = self;

        let result = tokio::task::spawn_blocking(move || {
            while let Some(data) = rx.blocking_recv() {
                trace!(bytes = data.len(), "PTY writer: writing");
                if let Err(e) = writer.write_all(&data).and_then(|_| writer.flush()) {
                    if e.kind() == std::io::ErrorKind::BrokenPipe {
                        debug!("PTY writer: broken pipe");
                    } else {
                        error!("PTY writer error: {}", e);
                    }
                    return writer;
                }
            }
            debug!("PTY writer: channel closed");
            writer
        })
        .await;

        match result {
            Ok(writer) => Some(writer),
            Err(e) => {
                error!("PTY writer task panicked: {}", e);
                None
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::session::SessionId;
    use std::io::Cursor;
    use std::time::Duration;

    #[tokio::test]
    async fn test_output_pump_emits_all_bytes() {
        let data = b"Hello, World!\nTest line 2\n";
        let (sink, mut rx) = EventSink::channel(SessionId::new("pty").unwrap(), 32);
        let pump = OutputPump::new(Cursor::new(data.to_vec()), sink).with_buffer_size(8);

        let handle = tokio::spawn(pump.run());

        let mut received = Vec::new();
        let mut chunks = 0;
        while let Ok(Some(event)) = tokio::time::timeout(Duration::from_secs(1), rx.recv()).await {
            assert_eq!(event.channel, CHANNEL_PTY_STDOUT);
            assert_eq!(event.event_type, TYPE_OUTPUT);
            received.extend(event.payload);
            chunks += 1;
        }
        handle.await.unwrap();

        assert_eq!(received, data);
        assert!(chunks > 1);
    }

    #[tokio::test]
    async fn test_output_pump_empty_reader() {
        let (sink, mut rx) = EventSink::channel(SessionId::new("pty").unwrap(), 4);
        let handle = tokio::spawn(OutputPump::new(Cursor::new(Vec::new()), sink).run());

        let result = tokio::time::timeout(Duration::from_secs(1), rx.recv()).await;
        assert!(result.unwrap().is_none());
        handle.await.unwrap();
    }

    #[tokio::test]
    async fn test_output_pump_stops_when_pipeline_dropped() {
        let (sink, rx) = EventSink::channel(SessionId::new("pty").unwrap(), 1);
        drop(rx);

        let pump = OutputPump::new(Cursor::new(vec![b'x'; 64 * 1024]), sink);
        let result = tokio::time::timeout(Duration::from_secs(1), pump.run()).await;
        assert!(result.is_ok());
    }

    #[tokio::test]
    async fn test_input_pump_writes_in_order() {
        let (tx, rx) = mpsc::channel(32);
        let pump = InputPump::new(Vec::new(), rx);

        tx.send(b"Hello".to_vec()).await.unwrap();
        tx.send(b", World!".to_vec()).await.unwrap();
        drop(tx);

        let written = tokio::time::timeout(Duration::from_secs(1), pump.run())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(written, b"Hello, World!");
    }
}
