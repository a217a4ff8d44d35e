use crate::{
    codec::Codec,
    config::Config,
    error::{Result, SmuxError},
    file::{File, Interest},
    frame::{ChannelId, DEFAULT_CHANNEL},
};
use bytes::{Buf, BytesMut};
use nix::errno::Errno;
use nix::poll::{poll, PollFd, PollFlags, PollTimeout};
use nix::unistd::pipe;
use std::cell::RefCell;
use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::fs;
use std::io::{Read, Write};
use std::os::fd::{AsRawFd, BorrowedFd, RawFd};
use std::rc::Rc;
use std::sync::Arc;

/// One direction of one channel: a file, the bytes decoded for it that still
/// await writing, and the descriptors it most recently asked to have watched
/// (so they can be retracted when they change).
struct HalfChannel {
    /// `None` for the master halves.
    channel: Option<ChannelId>,
    file: Box<dyn File>,
    /// Decoded bytes awaiting write to the file.
    out_queue: BytesMut,
    /// Bytes read from the file that the encoder has not accepted yet. While
    /// non-empty, the half-channel's read descriptors are withheld from the
    /// wait set.
    in_backlog: BytesMut,
    /// Descriptors currently registered on this half-channel's behalf.
    interest: Interest,
    /// Set when the file erred; the half-channel stops participating.
    failed: bool,
}

impl HalfChannel {
    fn new(channel: Option<ChannelId>, file: Box<dyn File>) -> Self {
        Self {
            channel,
            file,
            out_queue: BytesMut::new(),
            in_backlog: BytesMut::new(),
            interest: Interest::default(),
            failed: false,
        }
    }
}

type SharedHalf = Rc<RefCell<HalfChannel>>;

/// Input and output half of one channel; both may point at the same file.
#[derive(Default)]
struct Binding {
    input: Option<SharedHalf>,
    output: Option<SharedHalf>,
}

/// The three descriptor masks handed to the wait primitive.
#[derive(Default)]
struct WaitSet {
    read: BTreeSet<RawFd>,
    write: BTreeSet<RawFd>,
    except: BTreeSet<RawFd>,
}

impl WaitSet {
    fn remove(&mut self, fd: RawFd) {
        self.read.remove(&fd);
        self.write.remove(&fd);
        self.except.remove(&fd);
    }

    /// Poll events per descriptor, in ascending descriptor order.
    fn merged(&self) -> BTreeMap<RawFd, PollFlags> {
        let mut map: BTreeMap<RawFd, PollFlags> = BTreeMap::new();
        for &fd in &self.read {
            *map.entry(fd).or_insert(PollFlags::empty()) |= PollFlags::POLLIN;
        }
        for &fd in &self.write {
            *map.entry(fd).or_insert(PollFlags::empty()) |= PollFlags::POLLOUT;
        }
        for &fd in &self.except {
            *map.entry(fd).or_insert(PollFlags::empty()) |= PollFlags::POLLPRI;
        }
        map
    }
}

/// Wakes a running [`Runtime`] out of its wait and makes it exit.
///
/// Cloneable and safe to use from a signal handler: `shutdown` performs a
/// single one-byte write to a pipe.
#[derive(Debug, Clone)]
pub struct ShutdownHandle {
    pipe: Arc<fs::File>,
}

impl ShutdownHandle {
    pub fn shutdown(&self) {
        let _ = (&*self.pipe).write(&[0u8]);
    }
}

/// Single-threaded readiness-driven loop binding a [`Codec`] to real files.
///
/// The runtime owns the master half-channels (the transport carrying the
/// multiplexed stream) and any number of per-channel half-channels. It drains
/// the master through the codec into per-channel out-queues and feeds
/// per-channel reads back through the codec onto the master, blocking only in
/// the wait primitive.
pub struct Runtime {
    codec: Codec,
    receive_chunk_size: usize,
    master_in: Option<SharedHalf>,
    master_out: Option<SharedHalf>,
    channels: HashMap<ChannelId, Binding>,
    /// Which half-channel currently owns each registered descriptor.
    owners: BTreeMap<RawFd, SharedHalf>,
    wait: WaitSet,
    shutdown_rx: fs::File,
    shutdown_tx: Arc<fs::File>,
}

impl Runtime {
    /// Runtime whose master reads and writes the same file.
    pub fn new(config: &Config, master: Box<dyn File>) -> Result<Self> {
        let mut runtime = Self::bare(config)?;
        let half = Rc::new(RefCell::new(HalfChannel::new(None, master)));
        runtime.master_in = Some(Rc::clone(&half));
        runtime.master_out = Some(half);
        Ok(runtime)
    }

    /// Runtime with distinct (or partially absent) master input and output.
    ///
    /// Without a master input no data is ever received; without a master
    /// output, encoded bytes are discarded. Both degenerate setups are
    /// allowed and logged.
    pub fn with_split_master(
        config: &Config,
        master_in: Option<Box<dyn File>>,
        master_out: Option<Box<dyn File>>,
    ) -> Result<Self> {
        let mut runtime = Self::bare(config)?;
        runtime.master_in =
            master_in.map(|file| Rc::new(RefCell::new(HalfChannel::new(None, file))));
        runtime.master_out =
            master_out.map(|file| Rc::new(RefCell::new(HalfChannel::new(None, file))));
        Ok(runtime)
    }

    fn bare(config: &Config) -> Result<Self> {
        config.validate()?;
        let codec = Codec::new(config)?;
        let (shutdown_rx, shutdown_tx) = pipe()?;
        Ok(Self {
            codec,
            receive_chunk_size: config.receive_chunk_size,
            master_in: None,
            master_out: None,
            channels: HashMap::new(),
            owners: BTreeMap::new(),
            wait: WaitSet::default(),
            shutdown_rx: fs::File::from(shutdown_rx),
            shutdown_tx: Arc::new(fs::File::from(shutdown_tx)),
        })
    }

    /// Register `io` as both input and output of `channel`, replacing any
    /// previous binding.
    pub fn add_channel(&mut self, channel: ChannelId, io: Box<dyn File>) {
        let half = Rc::new(RefCell::new(HalfChannel::new(Some(channel), io)));
        let binding = self.channels.entry(channel).or_default();
        binding.input = Some(Rc::clone(&half));
        binding.output = Some(half);
    }

    /// Register separate input and output files for `channel`. `None` leaves
    /// the respective direction unbound.
    pub fn add_channel_split(
        &mut self,
        channel: ChannelId,
        input: Option<Box<dyn File>>,
        output: Option<Box<dyn File>>,
    ) {
        let binding = self.channels.entry(channel).or_default();
        if let Some(file) = input {
            binding.input = Some(Rc::new(RefCell::new(HalfChannel::new(Some(channel), file))));
        }
        if let Some(file) = output {
            binding.output = Some(Rc::new(RefCell::new(HalfChannel::new(Some(channel), file))));
        }
    }

    pub fn shutdown_handle(&self) -> ShutdownHandle {
        ShutdownHandle {
            pipe: Arc::clone(&self.shutdown_tx),
        }
    }

    /// Run until the master input reaches EOF, a fatal error occurs, or a
    /// [`ShutdownHandle`] fires.
    pub fn run(&mut self) -> Result<()> {
        if self.master_in.is_none() {
            tracing::warn!("no master input file: cannot receive data");
        }
        if self.master_out.is_none() {
            tracing::warn!("no master output file: encoded data will be discarded");
        }

        for half in self.all_halves() {
            self.update(&half);
        }

        let mut scratch = vec![0u8; self.receive_chunk_size];
        tracing::debug!("entering main loop");

        loop {
            let shutdown_fd = self.shutdown_rx.as_raw_fd();
            let mut entries: Vec<(RawFd, PollFlags)> = vec![(shutdown_fd, PollFlags::POLLIN)];
            entries.extend(self.wait.merged());

            let mut pollfds: Vec<PollFd> = entries
                .iter()
                .map(|&(fd, events)| {
                    // SAFETY: each fd is owned by a registered file or by the
                    // self-pipe, both alive for the duration of the call.
                    PollFd::new(unsafe { BorrowedFd::borrow_raw(fd) }, events)
                })
                .collect();

            match poll(&mut pollfds, PollTimeout::NONE) {
                Ok(_) => {}
                Err(Errno::EINTR) => continue,
                Err(e) => return Err(e.into()),
            }

            let ready: Vec<(RawFd, PollFlags)> = entries
                .iter()
                .zip(&pollfds)
                .filter_map(|(&(fd, _), pollfd)| {
                    let revents = pollfd.revents().unwrap_or_else(PollFlags::empty);
                    (!revents.is_empty()).then_some((fd, revents))
                })
                .collect();

            if ready.iter().any(|&(fd, _)| fd == shutdown_fd) {
                let mut sink = [0u8; 16];
                let _ = self.shutdown_rx.read(&mut sink);
                tracing::debug!("shutdown signal received: leaving main loop");
                return Ok(());
            }

            for (fd, revents) in ready {
                if !self.dispatch(fd, revents, &mut scratch)? {
                    return Ok(());
                }
            }
        }
    }

    /// Handle one ready descriptor. Returns `Ok(false)` on clean shutdown.
    fn dispatch(&mut self, fd: RawFd, revents: PollFlags, scratch: &mut [u8]) -> Result<bool> {
        let Some(half) = self.owners.get(&fd).map(Rc::clone) else {
            return Ok(true);
        };

        let is_master_in = self
            .master_in
            .as_ref()
            .is_some_and(|m| Rc::ptr_eq(m, &half));
        let is_master_out = self
            .master_out
            .as_ref()
            .is_some_and(|m| Rc::ptr_eq(m, &half));

        // Error conditions surface through the direction the fd is
        // registered for, so the follow-up syscall reports them.
        let readable = revents
            .intersects(PollFlags::POLLIN | PollFlags::POLLHUP | PollFlags::POLLERR)
            && self.wait.read.contains(&fd);
        let writable = revents.intersects(PollFlags::POLLOUT | PollFlags::POLLERR)
            && self.wait.write.contains(&fd);
        let except = revents.intersects(PollFlags::POLLPRI) && self.wait.except.contains(&fd);

        if readable && !self.handle_read_ready(&half, fd, is_master_in, scratch)? {
            return Ok(false);
        }

        if writable {
            self.handle_write_ready(&half, fd, is_master_out)?;
        }

        if except {
            let outcome = half.borrow_mut().file.except_event(fd);
            if let Err(e) = outcome {
                if is_master_in || is_master_out {
                    return Err(e);
                }
                self.fail_half(&half, &e);
            }
        }

        // Out-queue occupancy, backlog or EOF state may have changed; the
        // master's pending wire bytes likewise.
        self.update(&half);
        if let Some(master_out) = self.master_out.as_ref().map(Rc::clone) {
            if !Rc::ptr_eq(&master_out, &half) {
                self.update(&master_out);
            }
        }

        Ok(true)
    }

    /// Returns `Ok(false)` when the master reached EOF (clean shutdown).
    fn handle_read_ready(
        &mut self,
        half: &SharedHalf,
        fd: RawFd,
        is_master_in: bool,
        scratch: &mut [u8],
    ) -> Result<bool> {
        let proceed = match half.borrow_mut().file.read_event(fd) {
            Ok(proceed) => proceed,
            Err(e) => {
                if is_master_in {
                    return Err(master_read_error(e));
                }
                self.fail_half(half, &e);
                return Ok(true);
            }
        };
        if !proceed {
            return Ok(true);
        }

        if is_master_in {
            self.pump_master_in(scratch)
        } else {
            self.pump_channel_in(half, scratch)?;
            Ok(true)
        }
    }

    fn handle_write_ready(
        &mut self,
        half: &SharedHalf,
        fd: RawFd,
        is_master_out: bool,
    ) -> Result<()> {
        let proceed = match half.borrow_mut().file.write_event(fd) {
            Ok(proceed) => proceed,
            Err(e) => {
                if is_master_out {
                    return Err(master_write_error(e));
                }
                self.fail_half(half, &e);
                return Ok(());
            }
        };
        if !proceed {
            return Ok(());
        }

        if is_master_out {
            // Pending wire bytes can move again; so can channels that
            // stalled against the saturated sink.
            self.flush_master()?;
            return self.pump_stalled();
        }

        let outcome = {
            let mut h = half.borrow_mut();
            if h.out_queue.is_empty() {
                return Ok(());
            }
            let HalfChannel {
                file, out_queue, ..
            } = &mut *h;
            file.write(out_queue).map(|written| {
                out_queue.advance(written.min(out_queue.len()));
                written
            })
        };
        match outcome {
            Ok(written) => {
                tracing::trace!(
                    channel = ?half.borrow().channel,
                    written,
                    "flushed out-queue"
                );
                Ok(())
            }
            Err(e) => {
                self.fail_half(half, &e);
                Ok(())
            }
        }
    }

    /// Fill the inbound ring from the master, then route every decoded
    /// delivery to its channel's out-queue.
    fn pump_master_in(&mut self, scratch: &mut [u8]) -> Result<bool> {
        let Some(master) = self.master_in.as_ref().map(Rc::clone) else {
            return Ok(true);
        };

        {
            let mut half = master.borrow_mut();
            let file = &mut half.file;
            self.codec
                .read_in(|buf| file.read(buf))
                .map_err(master_read_error)?;
        }

        loop {
            let Some((channel, n)) = self.codec.recv(scratch) else {
                break;
            };
            match self.channels.get(&channel).and_then(|b| b.output.clone()) {
                Some(out_half) => {
                    out_half.borrow_mut().out_queue.extend_from_slice(&scratch[..n]);
                    self.update(&out_half);
                    tracing::trace!(channel, len = n, "queued decoded bytes");
                }
                None => {
                    tracing::warn!(channel, len = n, "ignoring data for unknown channel");
                }
            }
        }

        if master.borrow().file.eof() {
            tracing::debug!("eof on master input: shutting down");
            return Ok(false);
        }
        Ok(true)
    }

    /// Read from a per-channel file and push the bytes through the encoder
    /// onto the master. File errors disable this half-channel only.
    fn pump_channel_in(&mut self, half: &SharedHalf, scratch: &mut [u8]) -> Result<()> {
        let n = match half.borrow_mut().file.read(scratch) {
            Ok(n) => n,
            Err(e) => {
                self.fail_half(half, &e);
                return Ok(());
            }
        };
        if n == 0 {
            // EOF: the file stops advertising its read descriptor; writes to
            // this channel continue.
            return Ok(());
        }

        half.borrow_mut().in_backlog.extend_from_slice(&scratch[..n]);
        self.pump_ingress(half)
    }

    /// Encode as much of the half-channel's backlog as the outbound ring and
    /// the master sink allow. Bytes are never dropped: what the encoder does
    /// not accept stays in the backlog and the channel's reads stall until
    /// the master drains.
    fn pump_ingress(&mut self, half: &SharedHalf) -> Result<()> {
        let channel = half.borrow().channel.unwrap_or(DEFAULT_CHANNEL);
        loop {
            let accepted = {
                let mut h = half.borrow_mut();
                if h.in_backlog.is_empty() {
                    return Ok(());
                }
                let accepted = self.codec.send(channel, &h.in_backlog);
                h.in_backlog.advance(accepted);
                accepted
            };
            let pending = self.flush_master()?;
            if pending > 0 && accepted == 0 {
                tracing::trace!(channel, backlog = half.borrow().in_backlog.len(), "stalled on master sink");
                return Ok(());
            }
        }
    }

    /// Drain the outbound ring to the master output. Errors here are fatal.
    fn flush_master(&mut self) -> Result<usize> {
        match self.master_out.as_ref().map(Rc::clone) {
            Some(master) => {
                let mut half = master.borrow_mut();
                let file = &mut half.file;
                self.codec
                    .write_out(|buf| file.write(buf))
                    .map_err(master_write_error)
            }
            None => self.codec.write_out(|buf| Ok(buf.len())),
        }
    }

    /// Re-run ingress for every channel holding a backlog, after the master
    /// sink accepted more bytes.
    fn pump_stalled(&mut self) -> Result<()> {
        let stalled: Vec<SharedHalf> = self
            .channels
            .values()
            .filter_map(|binding| binding.input.clone())
            .filter(|half| {
                let h = half.borrow();
                !h.failed && !h.in_backlog.is_empty()
            })
            .collect();
        for half in stalled {
            self.pump_ingress(&half)?;
            self.update(&half);
        }
        Ok(())
    }

    fn fail_half(&mut self, half: &SharedHalf, err: &SmuxError) {
        {
            let mut h = half.borrow_mut();
            tracing::warn!(channel = ?h.channel, error = %err, "half-channel failed, disabling it");
            h.failed = true;
        }
        self.update(half);
    }

    /// Re-query a half-channel for its descriptors: retract everything it
    /// had registered, then register its current interest. This is the only
    /// place descriptors enter or leave the wait set.
    fn update(&mut self, half: &SharedHalf) {
        let mut h = half.borrow_mut();

        for fd in h.interest.iter_all() {
            self.owners.remove(&fd);
            self.wait.remove(fd);
        }

        let mut fresh = Interest::default();
        if !h.failed {
            let is_master_out = self
                .master_out
                .as_ref()
                .is_some_and(|m| Rc::ptr_eq(m, half));
            let has_data = if is_master_out {
                self.codec.pending_out() > 0
            } else {
                !h.out_queue.is_empty()
            };
            h.file.select_fds(&mut fresh, has_data);
            if !h.in_backlog.is_empty() {
                // Stalled against the master sink: no more input until the
                // backlog drains.
                fresh.read.clear();
            }
        }

        for &fd in &fresh.read {
            self.owners.insert(fd, Rc::clone(half));
            self.wait.read.insert(fd);
        }
        for &fd in &fresh.write {
            self.owners.insert(fd, Rc::clone(half));
            self.wait.write.insert(fd);
        }
        for &fd in &fresh.except {
            self.owners.insert(fd, Rc::clone(half));
            self.wait.except.insert(fd);
        }

        h.interest = fresh;
    }

    fn all_halves(&self) -> Vec<SharedHalf> {
        let mut halves: Vec<SharedHalf> = Vec::new();
        let candidates = self
            .master_in
            .iter()
            .chain(self.master_out.iter())
            .chain(
                self.channels
                    .values()
                    .flat_map(|b| b.input.iter().chain(b.output.iter())),
            );
        for half in candidates {
            if !halves.iter().any(|seen| Rc::ptr_eq(seen, half)) {
                halves.push(Rc::clone(half));
            }
        }
        halves
    }
}

fn master_read_error(err: SmuxError) -> SmuxError {
    match err {
        SmuxError::Io(io_err) => SmuxError::MasterRead(io_err),
        other => other,
    }
}

fn master_write_error(err: SmuxError) -> SmuxError {
    match err {
        SmuxError::Io(io_err) => SmuxError::MasterWrite(io_err),
        other => other,
    }
}
