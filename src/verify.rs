//! The `send|expect` token framing the CLI front-ends layer on top of
//! the generic verify hooks.
//!
//! A token splits on the first `|` into the bytes to send and the bytes
//! to expect back; a token without `|` uses the whole string for both.
//! The exchange writes `send`, reads exactly `expect.len()` bytes and
//! compares them byte for byte.

use async_trait::async_trait;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

use crate::splice::{BoxedStream, ConnVerifier, PairVerifier};
use crate::Conn;

/// Single-connection token check, usable as a per-side verify hook.
#[derive(Debug, Clone)]
pub struct TokenVerifier {
    send: Vec<u8>,
    expect: Vec<u8>,
}

impl TokenVerifier {
    pub fn new(token: &str) -> Self {
        match token.split_once('|') {
            Some((send, expect)) => Self {
                send: send.as_bytes().to_vec(),
                expect: expect.as_bytes().to_vec(),
            },
            None => Self {
                send: token.as_bytes().to_vec(),
                expect: token.as_bytes().to_vec(),
            },
        }
    }

    /// `Ok(true)` on a clean exchange, `Ok(false)` on a byte mismatch,
    /// `Err` on I/O failure.
    async fn exchange<S>(&self, conn: &mut S) -> anyhow::Result<bool>
    where
        S: AsyncRead + AsyncWrite + Unpin + Send + ?Sized,
    {
        if !self.send.is_empty() {
            conn.write_all(&self.send).await?;
            conn.flush().await?;
        }
        if !self.expect.is_empty() {
            let mut got = vec![0u8; self.expect.len()];
            conn.read_exact(&mut got).await?;
            if got != self.expect {
                return Ok(false);
            }
        }
        Ok(true)
    }
}

#[async_trait]
impl ConnVerifier for TokenVerifier {
    async fn verify(&self, conn: &mut Conn) -> anyhow::Result<bool> {
        self.exchange(conn).await
    }
}

/// Pre-splice hook running an optional token exchange on each side of a
/// matched pair, A first.
pub struct PairTokenVerifier {
    a: Option<TokenVerifier>,
    b: Option<TokenVerifier>,
}

impl PairTokenVerifier {
    pub fn new(a: Option<&str>, b: Option<&str>) -> Self {
        Self {
            a: a.map(TokenVerifier::new),
            b: b.map(TokenVerifier::new),
        }
    }
}

#[async_trait]
impl PairVerifier for PairTokenVerifier {
    async fn verify(
        &self,
        mut a: BoxedStream,
        mut b: BoxedStream,
    ) -> anyhow::Result<(BoxedStream, BoxedStream)> {
        if let Some(token) = &self.a
            && !token.exchange(&mut *a).await?
        {
            anyhow::bail!("a-side token mismatch");
        }
        if let Some(token) = &self.b
            && !token.exchange(&mut *b).await?
        {
            anyhow::bail!("b-side token mismatch");
        }
        Ok((a, b))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::time::{Duration, timeout};

    #[test]
    fn token_splits_on_first_pipe() {
        let t = TokenVerifier::new("hello|world|x");
        assert_eq!(t.send, b"hello");
        assert_eq!(t.expect, b"world|x");

        let t = TokenVerifier::new("secret");
        assert_eq!(t.send, b"secret");
        assert_eq!(t.expect, b"secret");
    }

    #[tokio::test]
    async fn exchange_round_trip() {
        let (mut ours, mut theirs) = tokio::io::duplex(64);
        let peer = tokio::spawn(async move {
            let mut got = [0u8; 4];
            theirs.read_exact(&mut got).await.unwrap();
            assert_eq!(&got, b"ping");
            theirs.write_all(b"pong").await.unwrap();
        });

        let t = TokenVerifier::new("ping|pong");
        assert!(t.exchange(&mut ours).await.unwrap());
        peer.await.unwrap();
    }

    #[tokio::test]
    async fn exchange_detects_mismatch() {
        let (mut ours, mut theirs) = tokio::io::duplex(64);
        let peer = tokio::spawn(async move {
            let mut got = [0u8; 4];
            theirs.read_exact(&mut got).await.unwrap();
            theirs.write_all(b"nope").await.unwrap();
        });

        let t = TokenVerifier::new("ping|pong");
        assert!(!t.exchange(&mut ours).await.unwrap());
        peer.await.unwrap();
    }

    #[tokio::test]
    async fn pair_hook_exchanges_both_sides() {
        let (a_engine, mut a_peer) = tokio::io::duplex(64);
        let (b_engine, mut b_peer) = tokio::io::duplex(64);

        let peers = tokio::spawn(async move {
            let mut got = [0u8; 2];
            a_peer.read_exact(&mut got).await.unwrap();
            assert_eq!(&got, b"aa");
            a_peer.write_all(b"aa").await.unwrap();

            b_peer.read_exact(&mut got).await.unwrap();
            assert_eq!(&got, b"bb");
            b_peer.write_all(b"bb").await.unwrap();
        });

        let hook = PairTokenVerifier::new(Some("aa"), Some("bb"));
        let verified = timeout(
            Duration::from_secs(2),
            hook.verify(Box::new(a_engine), Box::new(b_engine)),
        )
        .await
        .unwrap();
        assert!(verified.is_ok());
        peers.await.unwrap();
    }
}
