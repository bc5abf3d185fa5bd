// Copyright 2023 Toolchain Labs, Inc. All rights reserved.
// Licensed under the Apache License, Version 2.0 (see LICENSE).

//! mTLS plumbing for the SDS listener.
//!
//! The server config is rebuilt from the cert manager's current snapshot
//! for every accepted connection, so a rotation is picked up at the next
//! handshake without restarting the listener. Client certificates are
//! required and verified against the full root pool.

use std::io::IoSlice;
use std::net::SocketAddr;
use std::pin::Pin;
use std::sync::Arc;
use std::task::{Context, Poll};

use certs::CertSnapshot;
use rustls::pki_types::{CertificateDer, PrivateKeyDer};
use rustls::server::WebPkiClientVerifier;
use rustls::{RootCertStore, ServerConfig};
use tokio::io::{AsyncRead, AsyncWrite, ReadBuf};
use tokio::net::TcpStream;
use tonic::transport::server::Connected;

use crate::Error;

fn pem_certs(pem: &str) -> Result<Vec<CertificateDer<'static>>, Error> {
    rustls_pemfile::certs(&mut pem.as_bytes())
        .collect::<Result<Vec<_>, _>>()
        .map_err(|err| Error::InvalidTls(format!("certificate PEM: {err}")))
}

fn pem_key(pem: &str) -> Result<PrivateKeyDer<'static>, Error> {
    rustls_pemfile::private_key(&mut pem.as_bytes())
        .map_err(|err| Error::InvalidTls(format!("private key PEM: {err}")))?
        .ok_or_else(|| Error::InvalidTls("private key PEM contained no key".to_owned()))
}

/// Build a require-and-verify-client-cert server config from one snapshot.
pub fn server_config(snapshot: &CertSnapshot) -> Result<ServerConfig, Error> {
    let mut roots = RootCertStore::empty();
    for pem in &snapshot.root_pool {
        for cert in pem_certs(pem)? {
            roots
                .add(cert)
                .map_err(|err| Error::InvalidTls(format!("root certificate: {err}")))?;
        }
    }
    if roots.is_empty() {
        return Err(Error::InvalidTls("root pool is empty".to_owned()));
    }
    let provider = Arc::new(rustls::crypto::ring::default_provider());
    let verifier = WebPkiClientVerifier::builder_with_provider(Arc::new(roots), provider.clone())
        .build()
        .map_err(|err| Error::InvalidTls(format!("client verifier: {err}")))?;

    let mut config = ServerConfig::builder_with_provider(provider)
        .with_safe_default_protocol_versions()
        .map_err(|err| Error::InvalidTls(format!("protocol versions: {err}")))?
        .with_client_cert_verifier(verifier)
        .with_single_cert(pem_certs(&snapshot.cert_pem)?, pem_key(&snapshot.key_pem)?)
        .map_err(|err| Error::InvalidTls(format!("server identity: {err}")))?;
    config.alpn_protocols = vec![b"h2".to_vec()];
    Ok(config)
}

/// Connection details tonic hands to the stream handlers.
#[derive(Clone, Debug)]
pub struct SdsConnectInfo {
    pub remote_addr: Option<SocketAddr>,
    /// DER of the peer's verified certificate chain, leaf first.
    pub peer_certificates: Arc<Vec<Vec<u8>>>,
}

/// An established mTLS connection served to tonic.
pub struct TlsConnection {
    inner: tokio_rustls::server::TlsStream<TcpStream>,
    remote_addr: Option<SocketAddr>,
}

impl TlsConnection {
    pub fn new(
        inner: tokio_rustls::server::TlsStream<TcpStream>,
        remote_addr: Option<SocketAddr>,
    ) -> Self {
        TlsConnection { inner, remote_addr }
    }
}

impl Connected for TlsConnection {
    type ConnectInfo = SdsConnectInfo;

    fn connect_info(&self) -> Self::ConnectInfo {
        let peer_certificates = self
            .inner
            .get_ref()
            .1
            .peer_certificates()
            .map(|certs| certs.iter().map(|cert| cert.as_ref().to_vec()).collect())
            .unwrap_or_default();
        SdsConnectInfo {
            remote_addr: self.remote_addr,
            peer_certificates: Arc::new(peer_certificates),
        }
    }
}

impl AsyncRead for TlsConnection {
    fn poll_read(
        mut self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<std::io::Result<()>> {
        Pin::new(&mut self.inner).poll_read(cx, buf)
    }
}

impl AsyncWrite for TlsConnection {
    fn poll_write(
        mut self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &[u8],
    ) -> Poll<std::io::Result<usize>> {
        Pin::new(&mut self.inner).poll_write(cx, buf)
    }

    fn poll_flush(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<std::io::Result<()>> {
        Pin::new(&mut self.inner).poll_flush(cx)
    }

    fn poll_shutdown(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<std::io::Result<()>> {
        Pin::new(&mut self.inner).poll_shutdown(cx)
    }

    fn poll_write_vectored(
        mut self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        bufs: &[IoSlice<'_>],
    ) -> Poll<std::io::Result<usize>> {
        Pin::new(&mut self.inner).poll_write_vectored(cx, bufs)
    }

    fn is_write_vectored(&self) -> bool {
        self.inner.is_write_vectored()
    }
}
