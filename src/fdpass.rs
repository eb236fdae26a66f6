//! Descriptor passing over the local-domain socket.
//!
//! `send_with_fds` emits a byte buffer together with an ordered descriptor
//! list as SCM_RIGHTS ancillary data; `recv_with_fds` collects both.  Other
//! ancillary levels are ignored by the underlying `sendfd` implementation.
//!
//! Receives are deliberately patient: the producer on the other end may
//! itself be waiting on a third worker to hand over a descriptor, so a
//! would-block read retries until a hard deadline (default 120 s).

use std::os::fd::{FromRawFd, OwnedFd, RawFd};
use std::time::Duration;

use sendfd::{RecvWithFd, SendWithFd};
use tokio::io::AsyncWriteExt;
use tokio::net::UnixStream;

use crate::error::{Result, RpcError};

/// Hard deadline for a patient receive.
pub const RECV_DEADLINE: Duration = Duration::from_secs(120);

/// Most descriptors one message may carry.
const MAX_FDS: usize = 32;

/// Send `data` with `fds` attached to the first byte.  Returns the total
/// bytes written (the whole buffer; short writes are continued without
/// re-attaching the descriptors).
pub async fn send_with_fds(stream: &mut UnixStream, data: &[u8], fds: &[RawFd]) -> Result<usize> {
    if fds.len() > MAX_FDS {
        return Err(RpcError::Transport(format!("too many descriptors ({})", fds.len())));
    }

    let mut sent = 0;
    loop {
        stream
            .writable()
            .await
            .map_err(|e| RpcError::Transport(format!("peer cannot receive: {e}")))?;
        match SendWithFd::send_with_fd(&*stream, &data[sent..], fds) {
            Ok(n) => {
                sent += n;
                break;
            }
            Err(e) if e.kind() == std::io::ErrorKind::WouldBlock => continue,
            Err(e) => {
                return Err(RpcError::Transport(format!("sendmsg with descriptors failed: {e}")));
            }
        }
    }

    // The descriptors went with the first byte; the rest is a plain write.
    if sent < data.len() {
        stream
            .write_all(&data[sent..])
            .await
            .map_err(|e| RpcError::Transport(format!("send continuation failed: {e}")))?;
        sent = data.len();
    }
    Ok(sent)
}

/// Receive up to `max` bytes plus any SCM_RIGHTS descriptors, waiting up to
/// `deadline` for the peer to produce something.
pub async fn recv_with_fds(
    stream: &mut UnixStream,
    max: usize,
    deadline: Duration,
) -> Result<(Vec<u8>, Vec<OwnedFd>)> {
    let attempt = async {
        let mut buf = vec![0u8; max];
        let mut raw_fds = [0 as RawFd; MAX_FDS];
        loop {
            stream.readable().await?;
            match RecvWithFd::recv_with_fd(&*stream, &mut buf, &mut raw_fds) {
                Ok((n, nfds)) => {
                    buf.truncate(n);
                    // SAFETY: the kernel just installed these descriptors in
                    // this process for us; we are their first and only owner.
                    let fds = raw_fds[..nfds]
                        .iter()
                        .map(|fd| unsafe { OwnedFd::from_raw_fd(*fd) })
                        .collect();
                    return Ok::<_, std::io::Error>((buf, fds));
                }
                Err(e) if e.kind() == std::io::ErrorKind::WouldBlock => continue,
                Err(e) => return Err(e),
            }
        }
    };

    match tokio::time::timeout(deadline, attempt).await {
        Ok(Ok(result)) => Ok(result),
        Ok(Err(e)) => Err(RpcError::Transport(format!("recvmsg with descriptors failed: {e}"))),
        Err(_) => Err(RpcError::Timeout),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::{Read, Seek, Write};
    use std::os::fd::AsRawFd;

    #[tokio::test]
    async fn bytes_and_descriptors_arrive_together() {
        let (mut a, mut b) = UnixStream::pair().unwrap();

        let mut tmp = tempfile::tempfile().unwrap();
        tmp.write_all(b"carried across").unwrap();
        tmp.rewind().unwrap();

        let n = send_with_fds(&mut a, b"hello", &[tmp.as_raw_fd()]).await.unwrap();
        assert_eq!(n, 5);

        let (data, fds) = recv_with_fds(&mut b, 4096, Duration::from_secs(5)).await.unwrap();
        assert_eq!(data, b"hello");
        assert_eq!(fds.len(), 1);

        let mut received = std::fs::File::from(fds.into_iter().next().unwrap());
        let mut contents = String::new();
        received.read_to_string(&mut contents).unwrap();
        assert_eq!(contents, "carried across");
    }

    #[tokio::test]
    async fn descriptor_order_is_preserved() {
        let (mut a, mut b) = UnixStream::pair().unwrap();

        let mut files = Vec::new();
        for i in 0..3 {
            let mut f = tempfile::tempfile().unwrap();
            writeln!(f, "file {i}").unwrap();
            f.rewind().unwrap();
            files.push(f);
        }
        let raw: Vec<RawFd> = files.iter().map(|f| f.as_raw_fd()).collect();
        send_with_fds(&mut a, b"x", &raw).await.unwrap();

        let (_, fds) = recv_with_fds(&mut b, 4096, Duration::from_secs(5)).await.unwrap();
        assert_eq!(fds.len(), 3);
        for (i, fd) in fds.into_iter().enumerate() {
            let mut f = std::fs::File::from(fd);
            let mut s = String::new();
            f.read_to_string(&mut s).unwrap();
            assert_eq!(s, format!("file {i}\n"));
        }
    }

    #[tokio::test]
    async fn plain_bytes_need_no_descriptors() {
        let (mut a, mut b) = UnixStream::pair().unwrap();
        send_with_fds(&mut a, b"no fds here", &[]).await.unwrap();
        let (data, fds) = recv_with_fds(&mut b, 4096, Duration::from_secs(5)).await.unwrap();
        assert_eq!(data, b"no fds here");
        assert!(fds.is_empty());
    }

    #[tokio::test]
    async fn recv_deadline_expires_as_timeout() {
        let (_a, mut b) = UnixStream::pair().unwrap();
        let err = recv_with_fds(&mut b, 4096, Duration::from_millis(50)).await.unwrap_err();
        assert!(matches!(err, RpcError::Timeout));
    }
}
