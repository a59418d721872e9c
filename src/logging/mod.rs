use std::io::{self, Write};
use std::str::FromStr;

use async_trait::async_trait;
use env_logger::Builder;
use log::LevelFilter;
use pingora::{
    server::{ListenFds, ShutdownWatch},
    services::Service,
};
use tokio::{
    fs::{create_dir_all, metadata, File, OpenOptions},
    io::{AsyncWrite, AsyncWriteExt, BufWriter},
    sync::mpsc::{unbounded_channel, UnboundedReceiver, UnboundedSender},
};

use crate::config;

/// `io::Write` side of the log pipe, handed to env_logger.
pub struct AsyncWriter {
    sender: UnboundedSender<Vec<u8>>,
}

impl Write for AsyncWriter {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        let data = buf.to_vec();
        self.sender
            .send(data)
            .map_err(|e| io::Error::new(io::ErrorKind::Other, e))?;
        Ok(buf.len())
    }

    fn flush(&mut self) -> io::Result<()> {
        Ok(())
    }
}

/// File logger: env_logger writes into a channel, and this service drains
/// the channel into `log.path` until shutdown.
pub struct Logger {
    sender: UnboundedSender<Vec<u8>>,
    receiver: UnboundedReceiver<Vec<u8>>,
    config: config::Log,
}

impl Logger {
    pub fn new(config: config::Log) -> Self {
        let (sender, receiver) = unbounded_channel::<Vec<u8>>();
        Self {
            sender,
            receiver,
            config,
        }
    }

    fn create_async_writer(&self) -> AsyncWriter {
        AsyncWriter {
            sender: self.sender.clone(),
        }
    }

    /// Configured level, `info` when unset or unparsable.
    pub fn level(&self) -> LevelFilter {
        self.config
            .level
            .as_deref()
            .and_then(|l| LevelFilter::from_str(l).ok())
            .unwrap_or(LevelFilter::Info)
    }

    pub fn init_env_logger(&self) {
        let writer = self.create_async_writer();
        Builder::from_env(env_logger::Env::default())
            .filter(None, self.level())
            .target(env_logger::Target::Pipe(Box::new(writer)))
            .init();
    }

    async fn open_file(&self) -> io::Result<BufWriter<File>> {
        let log_file_path = &self.config.path;
        if let Some(parent) = std::path::Path::new(log_file_path).parent() {
            if !parent.as_os_str().is_empty() && metadata(parent).await.is_err() {
                create_dir_all(parent).await?;
            }
        }

        let file = OpenOptions::new()
            .append(true)
            .create(true)
            .open(log_file_path)
            .await?;
        Ok(BufWriter::new(file))
    }

    /// Copy log lines into `sink` until shutdown, then flush what is left.
    async fn drain<W>(&mut self, sink: &mut W, mut shutdown: ShutdownWatch)
    where
        W: AsyncWrite + Unpin + ?Sized,
    {
        loop {
            tokio::select! {
                biased;
                _ = shutdown.changed() => {
                    if *shutdown.borrow() {
                        log::info!("Shutdown signal received, stopping write log");
                        break;
                    }
                },

                data = self.receiver.recv() => {
                    match data {
                        Some(data) => {
                            if let Err(e) = sink.write_all(&data).await {
                                eprintln!("Failed to write log: {e}");
                            }
                        }
                        None => break,
                    }
                }
            }
        }

        // whatever was logged during shutdown
        while let Ok(data) = self.receiver.try_recv() {
            let _ = sink.write_all(&data).await;
        }
        if let Err(e) = sink.flush().await {
            eprintln!("Failed to flush log: {e}");
        }
    }
}

#[async_trait]
impl Service for Logger {
    async fn start_service(&mut self, _fds: Option<ListenFds>, shutdown: ShutdownWatch) {
        match self.open_file().await {
            Ok(mut file) => self.drain(&mut file, shutdown).await,
            Err(e) => {
                // env_logger already writes into the pipe, keep draining it
                eprintln!(
                    "Failed to open log file {}: {e}, logging to stderr",
                    self.config.path
                );
                let mut stderr = tokio::io::stderr();
                self.drain(&mut stderr, shutdown).await;
            }
        }
    }

    fn name(&self) -> &'static str {
        "log sync"
    }

    fn threads(&self) -> Option<usize> {
        Some(1)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn logger(level: Option<&str>) -> Logger {
        Logger::new(config::Log {
            path: "/tmp/batchgate-test.log".to_string(),
            level: level.map(str::to_string),
        })
    }

    #[test]
    fn test_level() {
        assert_eq!(logger(None).level(), LevelFilter::Info);
        assert_eq!(logger(Some("debug")).level(), LevelFilter::Debug);
        assert_eq!(logger(Some("WARN")).level(), LevelFilter::Warn);
        assert_eq!(logger(Some("loud")).level(), LevelFilter::Info);
    }

    #[tokio::test]
    async fn test_unopenable_file_still_drains() {
        let mut logger = Logger::new(config::Log {
            path: "/proc/batchgate/no/such/dir/batchgate.log".to_string(),
            level: None,
        });
        assert!(logger.open_file().await.is_err());

        let mut writer = logger.create_async_writer();
        writer.write_all(b"first\n").unwrap();
        writer.write_all(b"second\n").unwrap();

        let (shutdown_tx, shutdown_rx) = tokio::sync::watch::channel(false);
        shutdown_tx.send(true).unwrap();
        let mut sink: Vec<u8> = Vec::new();
        logger.drain(&mut sink, shutdown_rx).await;

        assert_eq!(sink, b"first\nsecond\n");
        assert!(logger.receiver.is_empty());
    }

    #[test]
    fn test_writer_feeds_channel() {
        let mut logger = logger(None);
        let mut writer = logger.create_async_writer();
        writer.write_all(b"hello\n").unwrap();
        assert_eq!(logger.receiver.try_recv().unwrap(), b"hello\n");
    }
}
