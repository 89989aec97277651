//! Part Exchange Server
//!
//! Serves committed parts to other replicas: manifest first, then each
//! file, then a terminator. Parts that are not committed are refused.

use std::sync::Arc;

use tokio::net::{TcpListener, TcpStream};
use tokio::sync::watch;

use super::{read_frame, write_frame, Request, Response};
use crate::error::{Error, Result};
use crate::part::PartName;
use crate::storage::LocalStore;

/// Serves part files to other replicas
pub struct PartServer {
    local: Arc<dyn LocalStore>,
    compression: bool,
}

impl PartServer {
    pub fn new(local: Arc<dyn LocalStore>, compression: bool) -> Self {
        Self { local, compression }
    }

    /// Bind and return the actual listening address
    pub async fn bind(&self, address: &str) -> Result<(TcpListener, String)> {
        let listener = TcpListener::bind(address).await?;
        let actual = listener.local_addr()?.to_string();
        tracing::info!(address = %actual, "part exchange server listening");
        Ok((listener, actual))
    }

    /// Accept loop; returns when the shutdown flag flips
    pub async fn run(
        self: Arc<Self>,
        listener: TcpListener,
        mut shutdown: watch::Receiver<bool>,
    ) {
        loop {
            tokio::select! {
                accepted = listener.accept() => {
                    match accepted {
                        Ok((stream, peer)) => {
                            let server = Arc::clone(&self);
                            tokio::spawn(async move {
                                if let Err(e) = server.handle(stream).await {
                                    tracing::debug!(peer = %peer, error = %e, "part exchange connection closed");
                                }
                            });
                        }
                        Err(e) => {
                            tracing::warn!(error = %e, "part exchange accept failed");
                        }
                    }
                }
                _ = shutdown.changed() => {
                    if *shutdown.borrow() {
                        tracing::info!("part exchange server stopping");
                        return;
                    }
                }
            }
        }
    }

    async fn handle(&self, mut stream: TcpStream) -> Result<()> {
        stream.set_nodelay(true)?;
        let (mut reader, mut writer) = stream.split();

        let request: Request = read_frame(&mut reader).await?;
        let Request::FetchPart { part } = request;

        match self.serve_part(&part, &mut writer).await {
            Ok(()) => Ok(()),
            Err(e) => {
                let _ = write_frame(
                    &mut writer,
                    &Response::Error {
                        message: e.to_string(),
                    },
                )
                .await;
                Err(e)
            }
        }
    }

    async fn serve_part<W>(&self, part: &str, writer: &mut W) -> Result<()>
    where
        W: tokio::io::AsyncWrite + Unpin,
    {
        let name = PartName::parse(part)?;
        if !self.local.contains(&name).await? {
            return Err(Error::PartNotFound(part.to_string()));
        }
        let files = self.local.part_files(&name).await?;
        let manifest = self.local.part_checksums(&name).await?;

        write_frame(
            writer,
            &Response::Manifest {
                part: part.to_string(),
                manifest,
                compressed: self.compression,
            },
        )
        .await?;

        for (file_name, data) in &files.files {
            let payload = if self.compression {
                lz4_flex::compress_prepend_size(data)
            } else {
                data.clone()
            };
            write_frame(
                writer,
                &Response::FileData {
                    name: file_name.clone(),
                    data: payload,
                },
            )
            .await?;
        }

        write_frame(writer, &Response::Done).await?;
        tracing::debug!(part, files = files.files.len(), "served part");
        Ok(())
    }
}
