//! Bidirectional frame relay.
//!
//! Pumps opaque frames between the wrapped inbound call and an established
//! backend call on two independent tasks, distinguishing graceful
//! end-of-stream from transport failure. Both tasks are scoped to the call:
//! a failure on either side cancels the other.

use tokio::task::JoinHandle;
use tracing::debug;

use crate::backend::{BackendEvent, BackendStream};
use crate::stream::WrappedStream;
use crate::types::Status;

/// Relay frames between the inbound call and the backend call until the
/// backend finishes the call or either side fails.
pub async fn run(inbound: WrappedStream, outbound: BackendStream) -> Result<(), Status> {
    let (mut in_source, in_sink) = inbound.into_split();
    let (mut events, out_sink, cancel) = outbound.into_parts();

    // Inbound -> outbound: forward caller frames; a clean caller EOS
    // half-closes the backend and is the happy path for this direction.
    let mut inbound_pump: JoinHandle<Result<(), Status>> = tokio::spawn(async move {
        loop {
            match in_source.recv().await {
                Ok(Some(frame)) => out_sink.send(frame).await?,
                Ok(None) => {
                    if let Err(e) = out_sink.close_send().await {
                        debug!(error = %e, "failed to half-close backend send side");
                    }
                    return Ok(());
                }
                Err(e) => return Err(e),
            }
        }
    });

    // Outbound -> inbound: headers must precede the first frame on the wire;
    // the backend read pump preserves that order. The backend's final status
    // decides the call.
    let mut outbound_pump: JoinHandle<Result<(), Status>> = tokio::spawn(async move {
        loop {
            match events.recv().await {
                Some(BackendEvent::Header(metadata)) => in_sink.send_header(metadata).await?,
                Some(BackendEvent::Frame(frame)) => in_sink.send(frame).await?,
                Some(BackendEvent::Closed { status, trailer }) => {
                    in_sink.set_trailer(trailer);
                    return status.into_result();
                }
                None => return Err(Status::internal("backend stream ended unexpectedly")),
            }
        }
    });

    let mut inbound_done = false;
    for _ in 0..2 {
        tokio::select! {
            result = &mut inbound_pump, if !inbound_done => {
                inbound_done = true;
                match result {
                    Ok(Ok(())) => {
                        // Caller finished sending; the backend may keep
                        // responding, keep pumping the other direction.
                    }
                    Ok(Err(e)) => {
                        cancel.cancel();
                        outbound_pump.abort();
                        return Err(Status::internal(format!(
                            "failed proxying caller to service: {}",
                            e
                        )));
                    }
                    Err(join_error) => {
                        cancel.cancel();
                        outbound_pump.abort();
                        return Err(Status::internal(format!(
                            "inbound relay task failed: {}",
                            join_error
                        )));
                    }
                }
            }
            result = &mut outbound_pump => {
                cancel.cancel();
                inbound_pump.abort();
                return match result {
                    Ok(outcome) => outcome,
                    Err(join_error) => Err(Status::internal(format!(
                        "outbound relay task failed: {}",
                        join_error
                    ))),
                };
            }
        }
    }

    Err(Status::internal("frame relay should never reach this stage"))
}
