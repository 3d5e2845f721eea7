use std::{
    cell::Cell,
    future::Future,
    rc::Rc,
    time::{Duration, Instant},
};

use monoio::{
    buf::{IoBuf, IoBufMut, IoVecBuf, IoVecBufMut},
    io::{AsyncReadRent, AsyncWriteRent, Split},
    BufResult,
};

use crate::error::{HttpError, Result};

/// Largest slice handed to one write, so a large body reports progress while
/// the peer drains it.
const WRITE_SLICE: usize = 64 * 1024;

/// When the transport underneath last made progress.
#[derive(Debug, Clone)]
pub(crate) struct Activity(Rc<Cell<Instant>>);

impl Activity {
    pub(crate) fn new() -> Self {
        Self(Rc::new(Cell::new(Instant::now())))
    }

    #[inline]
    pub(crate) fn touch(&self) {
        self.0.set(Instant::now());
    }

    /// Resolves once nothing moved for `limit`.
    async fn stalled(&self, limit: Duration) {
        loop {
            let quiet = self.0.get().elapsed();
            if quiet >= limit {
                return;
            }
            monoio::time::sleep(limit - quiet).await;
        }
    }

    /// Run `op`, failing with [`HttpError::IdleTimeout`] when the transport
    /// stays quiet for `limit`. Every completed read or write re-arms the
    /// timer, so a slow but steady transfer never trips it.
    pub(crate) async fn watch<F: Future>(
        &self,
        limit: Option<Duration>,
        op: F,
    ) -> Result<F::Output> {
        let Some(limit) = limit else {
            return Ok(op.await);
        };
        self.touch();
        monoio::select! {
            out = op => Ok(out),
            _ = self.stalled(limit) => Err(HttpError::IdleTimeout(limit)),
        }
    }
}

/// A transport that records every completed operation in an [`Activity`].
#[derive(Debug)]
pub(crate) struct ActivityIo<IO> {
    io: IO,
    activity: Activity,
}

impl<IO> ActivityIo<IO> {
    #[inline]
    pub(crate) fn new(io: IO, activity: Activity) -> Self {
        Self { io, activity }
    }
}

impl<IO: AsyncReadRent> AsyncReadRent for ActivityIo<IO> {
    async fn read<T: IoBufMut>(&mut self, buf: T) -> BufResult<usize, T> {
        let res = self.io.read(buf).await;
        self.activity.touch();
        res
    }

    async fn readv<T: IoVecBufMut>(&mut self, buf: T) -> BufResult<usize, T> {
        let res = self.io.readv(buf).await;
        self.activity.touch();
        res
    }
}

impl<IO: AsyncWriteRent> AsyncWriteRent for ActivityIo<IO> {
    async fn write<T: IoBuf>(&mut self, buf: T) -> BufResult<usize, T> {
        let res = if buf.bytes_init() > WRITE_SLICE {
            let (res, slice) = self.io.write(buf.slice(..WRITE_SLICE)).await;
            (res, slice.into_inner())
        } else {
            self.io.write(buf).await
        };
        self.activity.touch();
        res
    }

    async fn writev<T: IoVecBuf>(&mut self, buf_vec: T) -> BufResult<usize, T> {
        let res = self.io.writev(buf_vec).await;
        self.activity.touch();
        res
    }

    #[inline]
    async fn flush(&mut self) -> std::io::Result<()> {
        self.io.flush().await
    }

    #[inline]
    async fn shutdown(&mut self) -> std::io::Result<()> {
        self.io.shutdown().await
    }
}

unsafe impl<IO: Split> Split for ActivityIo<IO> {}
