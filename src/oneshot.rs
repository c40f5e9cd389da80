//! Consume-once resource guards.
//!
//! A tunnel owns exactly one client connection and exactly one upstream
//! connection. [`OneShot`] hands a value out a single time and reports every
//! later attempt as an explicit error, so the HTTP layer riding on a tunnel
//! can never quietly open a second upstream socket or accept a second client.

use std::io;
use std::net::SocketAddr;
use std::pin::Pin;
use std::sync::Mutex;
use std::task::{ready, Context, Poll};
use thiserror::Error;
use tokio::io::{AsyncRead, AsyncWrite, ReadBuf};

#[derive(Error, Debug, Clone, Copy, PartialEq, Eq)]
pub enum OneShotError {
    #[error("resource already consumed")]
    Consumed,

    #[error("dialer closed: the upstream connection was already handed out")]
    DialerClosed,

    #[error("listener closed: the tunnel connection was already accepted")]
    ListenerClosed,
}

/// A locked optional slot with a single successful `take`.
pub struct OneShot<T> {
    slot: Mutex<Option<T>>,
}

impl<T> OneShot<T> {
    pub fn new(value: T) -> Self {
        Self {
            slot: Mutex::new(Some(value)),
        }
    }

    pub fn take(&self) -> Result<T, OneShotError> {
        self.slot
            .lock()
            .map_err(|_| OneShotError::Consumed)?
            .take()
            .ok_or(OneShotError::Consumed)
    }

    pub fn is_consumed(&self) -> bool {
        self.slot.lock().map(|slot| slot.is_none()).unwrap_or(true)
    }

    /// Consumes the slot without handing the value to a taker.
    pub fn close(&self) -> Option<T> {
        self.slot.lock().ok().and_then(|mut slot| slot.take())
    }
}

/// Dialer that yields the pre-established upstream connection once.
pub struct OneShotDialer<C> {
    conn: OneShot<C>,
}

impl<C> OneShotDialer<C> {
    pub fn new(conn: C) -> Self {
        Self {
            conn: OneShot::new(conn),
        }
    }

    pub fn dial(&self) -> Result<C, OneShotError> {
        self.conn.take().map_err(|_| OneShotError::DialerClosed)
    }

    pub fn is_spent(&self) -> bool {
        self.conn.is_consumed()
    }

    pub fn close(&self) -> Option<C> {
        self.conn.close()
    }
}

/// Listener whose first accept yields the tunnel connection and whose every
/// later accept reports the listener as closed.
pub struct OneShotListener<C> {
    conn: OneShot<C>,
    local_addr: Option<SocketAddr>,
}

impl<C> OneShotListener<C> {
    pub fn new(conn: C) -> Self {
        Self {
            conn: OneShot::new(conn),
            local_addr: None,
        }
    }

    pub fn with_local_addr(mut self, addr: SocketAddr) -> Self {
        self.local_addr = Some(addr);
        self
    }

    pub fn accept(&self) -> Result<C, OneShotError> {
        self.conn.take().map_err(|_| OneShotError::ListenerClosed)
    }

    pub fn local_addr(&self) -> Option<SocketAddr> {
        self.local_addr
    }

    pub fn close(&self) -> Option<C> {
        self.conn.close()
    }
}

type CloseCallback = Box<dyn FnOnce() + Send + 'static>;

/// Stream wrapper that runs a callback exactly once when the stream is shut
/// down or dropped, whichever happens first.
pub struct OnClose<C> {
    inner: C,
    callback: Option<CloseCallback>,
}

impl<C> OnClose<C> {
    pub fn new<F>(inner: C, callback: F) -> Self
    where
        F: FnOnce() + Send + 'static,
    {
        Self {
            inner,
            callback: Some(Box::new(callback)),
        }
    }

    pub fn get_ref(&self) -> &C {
        &self.inner
    }

    pub fn is_closed(&self) -> bool {
        self.callback.is_none()
    }

    fn fire(&mut self) {
        if let Some(callback) = self.callback.take() {
            callback();
        }
    }
}

impl<C> Drop for OnClose<C> {
    fn drop(&mut self) {
        self.fire();
    }
}

impl<C: AsyncRead + Unpin> AsyncRead for OnClose<C> {
    fn poll_read(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<io::Result<()>> {
        Pin::new(&mut self.get_mut().inner).poll_read(cx, buf)
    }
}

impl<C: AsyncWrite + Unpin> AsyncWrite for OnClose<C> {
    fn poll_write(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &[u8],
    ) -> Poll<io::Result<usize>> {
        Pin::new(&mut self.get_mut().inner).poll_write(cx, buf)
    }

    fn poll_flush(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        Pin::new(&mut self.get_mut().inner).poll_flush(cx)
    }

    fn poll_shutdown(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        let this = self.get_mut();
        let result = ready!(Pin::new(&mut this.inner).poll_shutdown(cx));
        this.fire();
        Poll::Ready(result)
    }

    fn poll_write_vectored(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        bufs: &[io::IoSlice<'_>],
    ) -> Poll<io::Result<usize>> {
        Pin::new(&mut self.get_mut().inner).poll_write_vectored(cx, bufs)
    }

    fn is_write_vectored(&self) -> bool {
        self.inner.is_write_vectored()
    }
}
