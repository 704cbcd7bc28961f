//! UDP sample ingestion and decoding.
//!
//! The headstage streams 32-bit sample words over one UDP port per chip.
//! Reception runs on a dedicated OS thread with its own poll loop so a
//! stall in the tick loop can never back up into packet loss; the thread
//! batches packets and hands them to the engine through a bounded channel.
//! Decoding happens on the consumer side, once per tick.
//!
//! Sample word layout (MSB to LSB): `[AC:16][DC:10][ChannelID:6]`.

use std::collections::HashMap;
use std::net::{Ipv4Addr, SocketAddrV4, UdpSocket};
use std::os::fd::AsRawFd;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

use crossbeam_channel::{bounded, Receiver, Sender, TrySendError};
use log::{error, info, warn};
use socket2::{Domain, Protocol, Socket, Type};

use crate::electrode::electrode_name;
use crate::error::Result;

/// Per-channel cap on samples decoded in one collection pass.
pub const BUFFER_SIZE: usize = 50_000;

/// Largest datagram the headstage emits.
const MAX_PACKET_BYTES: usize = 8200;

/// Batches queued between the receiver thread and the tick loop.
const QUEUE_CAPACITY: usize = 10_000;

/// Minimum spacing between queue pushes, to keep the queue coarse-grained.
const MIN_QUEUE_SEND_DELAY: Duration = Duration::from_millis(10);

/// Kernel receive buffer per socket.
const SOCKET_RCVBUF_BYTES: usize = 65_536;

/// Received datagrams tagged with their source port index.
type PacketBatch = Vec<(Vec<u8>, usize)>;

/// Decodes raw packets into per-channel AC/DC sample runs.
struct PacketDecoder {
    channels_per_port: usize,
    dwords_per_batch: usize,
    extract_dc: bool,
}

impl PacketDecoder {
    /// Decode one packet into the per-channel accumulators.
    ///
    /// Each batch of `dwords_per_batch` words carries one sample per channel
    /// in ascending channel order followed by four command-response words.
    /// The packet may start mid-batch; alignment is recovered from the first
    /// word whose channel-id bits are zero. Channels whose accumulator would
    /// exceed `BUFFER_SIZE` are skipped for this packet; the rest still land.
    fn process_packet(
        &self,
        buffer: &[u8],
        port_num: usize,
        ac: &mut [Vec<f32>],
        dc: &mut [Vec<f32>],
    ) {
        let words: Vec<u32> = buffer
            .chunks_exact(4)
            .map(|c| u32::from_le_bytes([c[0], c[1], c[2], c[3]]))
            .collect();

        let scan = words.len().min(self.dwords_per_batch);
        let first_channel_offset = words[..scan]
            .iter()
            .position(|w| w & 0b11_1111 == 0)
            .unwrap_or(0);

        // Complete batches only; trailing words are discarded.
        let num_new_samples = words.len() / self.dwords_per_batch;
        if num_new_samples == 0 {
            return;
        }

        let from_channel = port_num * self.channels_per_port;

        for i in 0..self.channels_per_port {
            let column = (first_channel_offset + i) % self.dwords_per_batch;
            let channel = from_channel + i;

            if ac[channel].len() + num_new_samples > BUFFER_SIZE {
                continue;
            }

            for batch in 0..num_new_samples {
                let word = words[batch * self.dwords_per_batch + column];

                let ac_sample = ((word >> 16) as f32 - 32768.0) * (0.195 / 1000.0 / 1000.0);
                ac[channel].push(ac_sample);

                let dc_sample = if self.extract_dc {
                    (((word >> 6) & 0b11_1111_1111) as f32 - 512.0) * (-19.23 / 1000.0)
                } else {
                    0.0
                };
                dc[channel].push(dc_sample);
            }
        }
    }
}

/// Lossless UDP receiver for one device's sample ports.
pub struct UdpDataReceiver {
    num_channels: usize,
    decoder: PacketDecoder,
    batch_rx: Receiver<PacketBatch>,
    running: Arc<AtomicBool>,
    receiver_thread: Option<JoinHandle<()>>,
}

impl UdpDataReceiver {
    pub fn new(
        ports: &[u16],
        channels_per_port: usize,
        dwords_per_batch: usize,
        extract_dc: bool,
    ) -> Result<Self> {
        let mut sockets = Vec::with_capacity(ports.len());

        for &port in ports {
            info!("listening for sample data on UDP port {port}");
            sockets.push(bind_sample_socket(port)?);
        }

        let (batch_tx, batch_rx) = bounded(QUEUE_CAPACITY);
        let running = Arc::new(AtomicBool::new(true));
        let thread_running = running.clone();

        let receiver_thread = thread::Builder::new()
            .name("udp-ingestor".to_string())
            .spawn(move || receiver_loop(sockets, thread_running, batch_tx))?;

        Ok(Self {
            num_channels: channels_per_port * ports.len(),
            decoder: PacketDecoder {
                channels_per_port,
                dwords_per_batch,
                extract_dc,
            },
            batch_rx,
            running,
            receiver_thread: Some(receiver_thread),
        })
    }

    /// Drain the queued batches and decode them into per-series sample runs.
    /// Returns an empty map when nothing arrived since the last call.
    pub fn collect_data(&mut self) -> HashMap<String, Vec<f32>> {
        let queue_size_approx = self.batch_rx.len();
        let mut batches_taken = 0;

        let mut ac: Vec<Vec<f32>> = vec![Vec::new(); self.num_channels];
        let mut dc: Vec<Vec<f32>> = vec![Vec::new(); self.num_channels];

        while batches_taken < queue_size_approx {
            let Ok(batch) = self.batch_rx.try_recv() else {
                break;
            };
            batches_taken += 1;

            for (buffer, port_num) in batch {
                self.decoder.process_packet(&buffer, port_num, &mut ac, &mut dc);
            }
        }

        if ac.iter().all(|channel| channel.is_empty()) {
            return HashMap::new();
        }

        let mut results = HashMap::with_capacity(self.num_channels * 2);

        for (i, (ac_samples, dc_samples)) in ac.into_iter().zip(dc).enumerate() {
            results.insert(electrode_name(i, "ac"), ac_samples);
            results.insert(electrode_name(i, "dc"), dc_samples);
        }

        results
    }

    pub fn close(&mut self) {
        self.running.store(false, Ordering::SeqCst);

        if let Some(thread) = self.receiver_thread.take() {
            let _ = thread.join();
        }
    }
}

impl Drop for UdpDataReceiver {
    fn drop(&mut self) {
        self.close();
    }
}

fn bind_sample_socket(port: u16) -> Result<UdpSocket> {
    let socket = Socket::new(Domain::IPV4, Type::DGRAM, Some(Protocol::UDP))?;
    socket.bind(&SocketAddrV4::new(Ipv4Addr::UNSPECIFIED, port).into())?;
    socket.set_nonblocking(true)?;
    socket.set_recv_buffer_size(SOCKET_RCVBUF_BYTES)?;
    Ok(socket.into())
}

/// Receiver thread: level-triggered poll across all ports, one datagram per
/// ready socket per round, batched pushes at >= 10 ms spacing. A full queue
/// is reported and the batch is retried; the kernel socket buffer is the
/// only place packets can be lost.
fn receiver_loop(sockets: Vec<UdpSocket>, running: Arc<AtomicBool>, batch_tx: Sender<PacketBatch>) {
    let mut poll_fds: Vec<libc::pollfd> = sockets
        .iter()
        .map(|socket| libc::pollfd {
            fd: socket.as_raw_fd(),
            events: libc::POLLIN,
            revents: 0,
        })
        .collect();

    let mut recv_buf = [0u8; MAX_PACKET_BYTES];
    let mut batch: PacketBatch = Vec::new();
    let mut last_queue_send_time = Instant::now();

    while running.load(Ordering::SeqCst) {
        for fd in poll_fds.iter_mut() {
            fd.revents = 0;
        }

        let ready = unsafe { libc::poll(poll_fds.as_mut_ptr(), poll_fds.len() as _, 1000) };
        if ready < 0 {
            error!("socket poll failed: {}", std::io::Error::last_os_error());
            continue;
        }

        for (port_num, fd) in poll_fds.iter().enumerate() {
            if fd.revents & libc::POLLIN == 0 {
                continue;
            }

            match sockets[port_num].recv(&mut recv_buf) {
                Ok(len) => batch.push((recv_buf[..len].to_vec(), port_num)),
                Err(ref e) if e.kind() == std::io::ErrorKind::WouldBlock => {}
                Err(e) => {
                    // The socket is not reopened here; reception on the
                    // other ports continues.
                    error!("recv failed on port index {port_num}: {e}");
                }
            }
        }

        if !batch.is_empty() && last_queue_send_time.elapsed() > MIN_QUEUE_SEND_DELAY {
            match batch_tx.try_send(std::mem::take(&mut batch)) {
                Ok(()) => last_queue_send_time = Instant::now(),
                Err(TrySendError::Full(returned)) => {
                    warn!("sample batch queue is full; retrying");
                    batch = returned;
                }
                Err(TrySendError::Disconnected(_)) => return,
            }
        }
    }
}
