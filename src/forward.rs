//! Packet forwarding between the TUN device and the virtual link endpoint.

use crate::error::{VnetError, VnetResult};
use crate::stack::MTU;
use crate::tun::{TunDevice, HEADER_RESERVE};
use std::sync::Arc;
use tokio::sync::mpsc;
use tokio::sync::mpsc::error::TrySendError;
use tokio_util::sync::CancellationToken;

/// Copy outbound frames from the link endpoint to the TUN device.
///
/// Blocks awaiting the next outbound frame; cancellable via `cancel`. Each
/// frame is staged into a single buffer at the device's header-reserve
/// offset and written back through the TUN in one call.
pub(crate) async fn forward_stack_to_tun(
    mut frames_out: mpsc::Receiver<Vec<u8>>,
    tun: Arc<dyn TunDevice>,
    cancel: CancellationToken,
) -> VnetResult<()> {
    let mut bufs = vec![Vec::with_capacity(HEADER_RESERVE + MTU)];
    loop {
        let frame = tokio::select! {
            biased;
            _ = cancel.cancelled() => return Err(VnetError::Canceled),
            frame = frames_out.recv() => match frame {
                Some(frame) => frame,
                // The link endpoint was closed at shutdown.
                None => return Err(VnetError::Canceled),
            },
        };

        let buf = &mut bufs[0];
        buf.clear();
        buf.resize(HEADER_RESERVE, 0);
        buf.extend_from_slice(&frame);
        if let Err(e) = tun.write(&mut bufs, HEADER_RESERVE).await {
            return Err(VnetError::io_with_source("writing packets to TUN device", e));
        }
    }
}

/// Copy inbound frames from the TUN device to the link endpoint.
///
/// The first nibble of every frame selects IPv4 or IPv6; anything else is
/// dropped silently. This loop is not token-cancelled: it terminates when the
/// TUN read fails, which happens when the device is closed at shutdown.
pub(crate) async fn forward_tun_to_stack(
    tun: Arc<dyn TunDevice>,
    frames_in: mpsc::Sender<Vec<u8>>,
    destroyed: CancellationToken,
) -> VnetResult<()> {
    log::debug!("Forwarding IP packets between the OS and the VNet.");
    let batch_size = tun.batch_size();
    let mut bufs: Vec<Vec<u8>> = (0..batch_size)
        .map(|_| vec![0u8; HEADER_RESERVE + MTU])
        .collect();
    let mut sizes = vec![0usize; batch_size];
    loop {
        let n = match tun.read(&mut bufs, &mut sizes, HEADER_RESERVE).await {
            Ok(n) => n,
            // A read failure after the shutdown signal is the expected way
            // this loop ends.
            Err(_) if destroyed.is_cancelled() => return Err(VnetError::Canceled),
            Err(e) => {
                return Err(VnetError::io_with_source(
                    "reading packets from TUN device",
                    e,
                ))
            }
        };
        for i in 0..n {
            let frame = &bufs[i][HEADER_RESERVE..HEADER_RESERVE + sizes[i]];
            match frame.first().map(|b| b >> 4) {
                Some(4) | Some(6) => match frames_in.try_send(frame.to_vec()) {
                    Ok(()) => {}
                    Err(TrySendError::Full(_)) => {
                        // Endpoint inbound queue full; drop the frame.
                    }
                    Err(TrySendError::Closed(_)) => return Err(VnetError::Canceled),
                },
                // Not IPv4/IPv6 (malformed or ARP-like traffic): drop.
                _ => {}
            }
        }
    }
}
