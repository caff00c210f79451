//! Context-aware bidirectional stream copy.

use tokio::io::{AsyncRead, AsyncWrite, AsyncWriteExt};

use crate::context::Context;
use crate::{Error, Result};

/// Bytes moved in each direction.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct Transferred {
    /// Bytes copied from the first stream to the second.
    pub a_to_b: u64,
    /// Bytes copied from the second stream to the first.
    pub b_to_a: u64,
}

/// Copy `a` ⇄ `b` concurrently until both directions reach EOF.
///
/// EOF on one side shuts down the write half of the other, so half-closed
/// protocols keep working. A failing direction stops the other one, and
/// every write half not yet shut down is shut down before returning; those
/// errors are joined with the failure. Returns the context error once `ctx`
/// is done.
pub async fn copy_bidirectional<A, B>(ctx: &Context, a: A, b: B) -> Result<Transferred>
where
    A: AsyncRead + AsyncWrite,
    B: AsyncRead + AsyncWrite,
{
    let (mut a_read, mut a_write) = tokio::io::split(a);
    let (mut b_read, mut b_write) = tokio::io::split(b);
    let halves = ctx.child();

    let (a_to_b, b_to_a) = tokio::join!(
        copy_half(&halves, &mut a_read, &mut b_write),
        copy_half(&halves, &mut b_read, &mut a_write),
    );
    ctx.check()?;

    let (a_to_b, b_to_a) = match (a_to_b, b_to_a) {
        (Ok(Some(a_to_b)), Ok(Some(b_to_a))) => return Ok(Transferred { a_to_b, b_to_a }),
        pair => pair,
    };

    let mut errors = Vec::new();
    if !finished("client to destination", a_to_b, &mut errors)
        && let Err(e) = b_write.shutdown().await
    {
        errors.push(Error::Proxy(format!("close destination: {e}")));
    }
    if !finished("destination to client", b_to_a, &mut errors)
        && let Err(e) = a_write.shutdown().await
    {
        errors.push(Error::Proxy(format!("close client: {e}")));
    }

    Err(Error::join(errors)
        .unwrap_or_else(|| Error::Internal("copy stopped without an error".into())))
}

/// Whether the direction ran to EOF and shut down its writer.
fn finished(
    direction: &str,
    result: std::io::Result<Option<u64>>,
    errors: &mut Vec<Error>,
) -> bool {
    match result {
        Ok(Some(_)) => true,
        Ok(None) => false,
        Err(e) => {
            errors.push(Error::Proxy(format!("copy {direction}: {e}")));
            false
        }
    }
}

/// `Ok(None)` when stopped because the other direction failed.
async fn copy_half<R, W>(
    halves: &Context,
    reader: &mut R,
    writer: &mut W,
) -> std::io::Result<Option<u64>>
where
    R: AsyncRead + Unpin,
    W: AsyncWrite + Unpin,
{
    let copied = async {
        let copied = tokio::io::copy(reader, writer).await?;
        writer.shutdown().await?;
        Ok::<_, std::io::Error>(copied)
    };
    match halves.run(copied).await {
        Ok(Ok(copied)) => Ok(Some(copied)),
        Ok(Err(e)) => {
            halves.cancel();
            Err(e)
        }
        Err(_) => Ok(None),
    }
}
