//! Bounded in-process pipe that carries producer failures to the consumer.
//!
//! A plain OS pipe reports a producer that died halfway as a clean EOF,
//! so the consumer would accept a truncated archive. Here the writer must
//! call [`PipeWriter::finish`] for the reader to see EOF; a writer that
//! fails or is dropped early surfaces as a read error. A reader that goes
//! away makes further writes fail with `BrokenPipe`.

use std::io::{self, Read, Write};
use std::sync::mpsc::{sync_channel, Receiver, SyncSender};

/// Size of the chunks handed from writer to reader.
pub const CHUNK_SIZE: usize = 64 * 1024;

enum Message {
    Data(Vec<u8>),
    Done,
    Failed(String),
}

/// Create a pipe holding at most `capacity` chunks in flight.
pub fn pipe(capacity: usize) -> (PipeWriter, PipeReader) {
    let (tx, rx) = sync_channel(capacity.max(1));
    (
        PipeWriter {
            tx: Some(tx),
            buf: Vec::with_capacity(CHUNK_SIZE),
        },
        PipeReader {
            rx,
            current: Vec::new(),
            pos: 0,
            done: false,
        },
    )
}

pub struct PipeWriter {
    tx: Option<SyncSender<Message>>,
    buf: Vec<u8>,
}

impl PipeWriter {
    fn send(&mut self, msg: Message) -> io::Result<()> {
        let tx = self
            .tx
            .as_ref()
            .ok_or_else(|| io::Error::new(io::ErrorKind::BrokenPipe, "pipe already closed"))?;
        tx.send(msg)
            .map_err(|_| io::Error::new(io::ErrorKind::BrokenPipe, "pipe reader closed"))
    }

    fn flush_buf(&mut self) -> io::Result<()> {
        if self.buf.is_empty() {
            return Ok(());
        }
        let chunk = std::mem::replace(&mut self.buf, Vec::with_capacity(CHUNK_SIZE));
        self.send(Message::Data(chunk))
    }

    /// Deliver buffered data and signal a complete stream.
    pub fn finish(mut self) -> io::Result<()> {
        self.flush_buf()?;
        self.send(Message::Done)?;
        self.tx = None;
        Ok(())
    }

    /// Abort the stream; the reader's next read returns this error.
    pub fn fail(mut self, reason: impl std::fmt::Display) {
        let _ = self.send(Message::Failed(reason.to_string()));
        self.tx = None;
    }
}

impl Write for PipeWriter {
    fn write(&mut self, data: &[u8]) -> io::Result<usize> {
        let room = CHUNK_SIZE - self.buf.len();
        let n = room.min(data.len());
        self.buf.extend_from_slice(&data[..n]);
        if self.buf.len() >= CHUNK_SIZE {
            self.flush_buf()?;
        }
        Ok(n)
    }

    fn flush(&mut self) -> io::Result<()> {
        self.flush_buf()
    }
}

impl Drop for PipeWriter {
    fn drop(&mut self) {
        if self.tx.is_some() {
            let _ = self.send(Message::Failed("stream ended before completion".to_owned()));
        }
    }
}

pub struct PipeReader {
    rx: Receiver<Message>,
    current: Vec<u8>,
    pos: usize,
    done: bool,
}

impl Read for PipeReader {
    fn read(&mut self, out: &mut [u8]) -> io::Result<usize> {
        loop {
            if self.pos < self.current.len() {
                let n = out.len().min(self.current.len() - self.pos);
                out[..n].copy_from_slice(&self.current[self.pos..self.pos + n]);
                self.pos += n;
                return Ok(n);
            }
            if self.done {
                return Ok(0);
            }
            match self.rx.recv() {
                Ok(Message::Data(chunk)) => {
                    self.current = chunk;
                    self.pos = 0;
                }
                Ok(Message::Done) => self.done = true,
                Ok(Message::Failed(reason)) => return Err(io::Error::other(reason)),
                Err(_) => {
                    return Err(io::Error::new(
                        io::ErrorKind::UnexpectedEof,
                        "pipe writer vanished",
                    ))
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn finished_stream_reads_to_eof() {
        let (mut w, mut r) = pipe(2);
        let producer = std::thread::spawn(move || {
            for _ in 0..100 {
                w.write_all(&[7u8; 3000]).unwrap();
            }
            w.finish().unwrap();
        });
        let mut got = Vec::new();
        r.read_to_end(&mut got).unwrap();
        producer.join().unwrap();
        assert_eq!(got.len(), 300_000);
        assert!(got.iter().all(|b| *b == 7));
    }

    #[test]
    fn failed_writer_surfaces_as_read_error() {
        let (mut w, mut r) = pipe(4);
        w.write_all(b"partial").unwrap();
        w.flush().unwrap();
        w.fail("archive entry vanished");
        let mut got = Vec::new();
        let err = r.read_to_end(&mut got).unwrap_err();
        assert!(err.to_string().contains("archive entry vanished"));
    }

    #[test]
    fn dropped_writer_is_not_clean_eof() {
        let (mut w, mut r) = pipe(4);
        w.write_all(b"data").unwrap();
        drop(w);
        let mut got = Vec::new();
        assert!(r.read_to_end(&mut got).is_err());
    }

    #[test]
    fn dropped_reader_breaks_writer() {
        let (mut w, r) = pipe(1);
        drop(r);
        let err = w.write_all(&vec![0u8; CHUNK_SIZE * 2]).unwrap_err();
        assert_eq!(err.kind(), io::ErrorKind::BrokenPipe);
    }
}
