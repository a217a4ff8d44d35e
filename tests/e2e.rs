use nix::unistd::pipe;
use smux::{Codec, Config, ConfigBuilder, FdFile, File, Interest, Runtime, ShutdownHandle};
use std::fs;
use std::io::{Read, Write};
use std::os::fd::{AsRawFd, RawFd};
use std::sync::mpsc;
use std::thread::{self, JoinHandle};

/// The runtime is single-threaded and not `Send`, so every test builds it
/// inside its own thread and gets the shutdown handle back over a channel.
fn spawn_runtime<F>(build: F) -> (ShutdownHandle, JoinHandle<smux::Result<()>>)
where
    F: FnOnce() -> Runtime + Send + 'static,
{
    let (handle_tx, handle_rx) = mpsc::channel();
    let thread = thread::spawn(move || {
        let mut runtime = build();
        handle_tx.send(runtime.shutdown_handle()).unwrap();
        runtime.run()
    });
    (handle_rx.recv().unwrap(), thread)
}

#[test]
fn test_routes_master_bytes_to_channel_files() {
    let (master_r, master_w) = pipe().unwrap();
    let (ch5_r, ch5_w) = pipe().unwrap();
    let (ch0_r, ch0_w) = pipe().unwrap();

    let (handle, runtime) = spawn_runtime(move || {
        let mut rt =
            Runtime::new(&Config::default(), Box::new(FdFile::reader(master_r))).unwrap();
        rt.add_channel_split(5, None, Some(Box::new(FdFile::writer(ch5_w))));
        rt.add_channel_split(0, None, Some(Box::new(FdFile::writer(ch0_w))));
        rt
    });

    let mut wire = fs::File::from(master_w);
    wire.write_all(b"hello\x01\x05\x00\x03GO!").unwrap();

    let mut ch5 = fs::File::from(ch5_r);
    let mut buf5 = [0u8; 3];
    ch5.read_exact(&mut buf5).unwrap();
    assert_eq!(&buf5, b"GO!");

    let mut ch0 = fs::File::from(ch0_r);
    let mut buf0 = [0u8; 5];
    ch0.read_exact(&mut buf0).unwrap();
    assert_eq!(&buf0, b"hello");

    handle.shutdown();
    runtime.join().unwrap().unwrap();
}

#[test]
fn test_encodes_channel_input_onto_master() {
    let (ch7_r, ch7_w) = pipe().unwrap();
    let (master_r, master_w) = pipe().unwrap();

    let (handle, runtime) = spawn_runtime(move || {
        let mut rt = Runtime::with_split_master(
            &Config::default(),
            None,
            Some(Box::new(FdFile::writer(master_w))),
        )
        .unwrap();
        rt.add_channel_split(7, Some(Box::new(FdFile::reader(ch7_r))), None);
        rt
    });

    let mut input = fs::File::from(ch7_w);
    input.write_all(b"ping").unwrap();

    let mut master = fs::File::from(master_r);
    let mut buf = [0u8; 8];
    master.read_exact(&mut buf).unwrap();
    assert_eq!(&buf, b"\x01\x07\x00\x04ping");

    handle.shutdown();
    runtime.join().unwrap().unwrap();
}

#[test]
fn test_two_runtimes_bridge_a_channel() {
    let (in_r, in_w) = pipe().unwrap();
    let (wire_r, wire_w) = pipe().unwrap();
    let (out_r, out_w) = pipe().unwrap();

    // Encoder side: channel 9 input, wire output.
    let (encoder_handle, encoder) = spawn_runtime(move || {
        let mut rt = Runtime::with_split_master(
            &Config::default(),
            None,
            Some(Box::new(FdFile::writer(wire_w))),
        )
        .unwrap();
        rt.add_channel_split(9, Some(Box::new(FdFile::reader(in_r))), None);
        rt
    });

    // Decoder side: wire input, channel 9 output.
    let (decoder_handle, decoder) = spawn_runtime(move || {
        let mut rt =
            Runtime::new(&Config::default(), Box::new(FdFile::reader(wire_r))).unwrap();
        rt.add_channel_split(9, None, Some(Box::new(FdFile::writer(out_w))));
        rt
    });

    // The payload contains the escape byte; it must arrive verbatim.
    let payload = b"round\x01trip\x01\x01data";
    let mut input = fs::File::from(in_w);
    input.write_all(payload).unwrap();

    let mut output = fs::File::from(out_r);
    let mut buf = vec![0u8; payload.len()];
    output.read_exact(&mut buf).unwrap();
    assert_eq!(buf, payload);

    encoder_handle.shutdown();
    encoder.join().unwrap().unwrap();
    decoder_handle.shutdown();
    decoder.join().unwrap().unwrap();
}

#[test]
fn test_channel_eof_does_not_stop_the_runtime() {
    let (ch3_r, ch3_w) = pipe().unwrap();
    let (master_r, master_w) = pipe().unwrap();

    let (handle, runtime) = spawn_runtime(move || {
        let mut rt = Runtime::with_split_master(
            &Config::default(),
            None,
            Some(Box::new(FdFile::writer(master_w))),
        )
        .unwrap();
        rt.add_channel_split(3, Some(Box::new(FdFile::reader(ch3_r))), None);
        rt
    });

    // Write one byte, then close the channel input entirely.
    let mut input = fs::File::from(ch3_w);
    input.write_all(b"x").unwrap();
    drop(input);

    let mut master = fs::File::from(master_r);
    let mut buf = [0u8; 5];
    master.read_exact(&mut buf).unwrap();
    assert_eq!(&buf, b"\x01\x03\x00\x01x");

    // The loop must still be alive and answer the shutdown signal.
    handle.shutdown();
    runtime.join().unwrap().unwrap();
}

/// Master sink that accepts only a few bytes per write-readiness event,
/// forcing the runtime through its backpressure path.
struct TrickleFile {
    inner: fs::File,
    budget: usize,
}

impl TrickleFile {
    fn new(inner: fs::File) -> Self {
        Self { inner, budget: 0 }
    }
}

impl File for TrickleFile {
    fn select_fds(&self, interest: &mut Interest, writer_has_data: bool) {
        if writer_has_data {
            interest.write.push(self.inner.as_raw_fd());
        }
    }

    fn write_event(&mut self, _fd: RawFd) -> smux::Result<bool> {
        self.budget = 4;
        Ok(true)
    }

    fn read(&mut self, _buf: &mut [u8]) -> smux::Result<usize> {
        Ok(0)
    }

    fn write(&mut self, buf: &[u8]) -> smux::Result<usize> {
        let n = self.budget.min(buf.len());
        if n == 0 {
            return Ok(0);
        }
        let written = (&self.inner).write(&buf[..n])?;
        self.budget -= written;
        Ok(written)
    }

    fn eof(&self) -> bool {
        false
    }
}

#[test]
fn test_backpressured_master_loses_no_bytes() {
    let (ch2_r, ch2_w) = pipe().unwrap();
    let (master_r, master_w) = pipe().unwrap();

    let (handle, runtime) = spawn_runtime(move || {
        // A tiny outbound ring plus a trickling sink: the channel input must
        // stall and resume instead of dropping bytes.
        let config = ConfigBuilder::new().write_buffer_size(16).build().unwrap();
        let mut rt = Runtime::with_split_master(
            &config,
            None,
            Some(Box::new(TrickleFile::new(fs::File::from(master_w)))),
        )
        .unwrap();
        rt.add_channel_split(2, Some(Box::new(FdFile::reader(ch2_r))), None);
        rt
    });

    let payload = b"0123456789abcdefghij";
    let mut input = fs::File::from(ch2_w);
    input.write_all(payload).unwrap();

    // Reassemble whatever framing the runtime chose and compare payloads.
    let mut master = fs::File::from(master_r);
    let mut decoder = Codec::new(&Config::default()).unwrap();
    let mut received = Vec::new();
    let mut chunk = [0u8; 64];
    let mut delivery = [0u8; 64];
    while received.len() < payload.len() {
        let n = master.read(&mut chunk).unwrap();
        assert!(n > 0, "wire closed before the payload arrived");
        assert_eq!(decoder.ingest(&chunk[..n]), n);
        while let Some((channel, len)) = decoder.recv(&mut delivery) {
            assert_eq!(channel, 2);
            received.extend_from_slice(&delivery[..len]);
        }
    }
    assert_eq!(received, payload);

    handle.shutdown();
    runtime.join().unwrap().unwrap();
}
