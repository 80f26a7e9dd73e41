use anyhow::{anyhow, Result};
use dirfetch::codec::{Frame, ResponseDecoder};
use dirfetch::{
    fetch, ClientConfig, Server, ServerConfig, ShutdownHandle, TaskQueue, TransferError,
};
use std::collections::BTreeMap;
use std::io::{Read, Write};
use std::net::{IpAddr, Ipv4Addr, SocketAddr, TcpStream};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

fn write_file(path: &Path, size: usize) -> Result<()> {
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent)?;
    }
    let mut f = std::fs::File::create(path)?;
    let mut val: u8 = (size % 251) as u8;
    let data: Vec<u8> = (0..size)
        .map(|_| {
            val = val.wrapping_add(1);
            val
        })
        .collect();
    f.write_all(&data)?;
    Ok(())
}

/// Relative path -> contents for every regular file under `root`
fn snapshot(root: &Path) -> Result<BTreeMap<String, Vec<u8>>> {
    let mut out = BTreeMap::new();
    for entry in walkdir::WalkDir::new(root).min_depth(1) {
        let entry = entry?;
        if entry.file_type().is_file() {
            let rel = entry.path().strip_prefix(root)?;
            let rel = rel
                .components()
                .map(|c| c.as_os_str().to_string_lossy().into_owned())
                .collect::<Vec<_>>()
                .join("/");
            out.insert(rel, std::fs::read(entry.path())?);
        }
    }
    Ok(out)
}

struct TestServer {
    addr: SocketAddr,
    shutdown: ShutdownHandle,
    queue: Arc<TaskQueue>,
    handle: Option<JoinHandle<dirfetch::error::Result<()>>>,
}

impl TestServer {
    fn start(root: &Path, workers: usize, queue_size: usize, block_size: usize) -> Result<Self> {
        let config = ServerConfig {
            bind: IpAddr::V4(Ipv4Addr::LOCALHOST),
            port: 0,
            thread_pool_size: workers,
            queue_size,
            block_size,
            root: root.to_path_buf(),
        };
        let server = Server::bind(&config)?;
        let addr = server.local_addr()?;
        let shutdown = server.shutdown_handle()?;
        let queue = server.queue();
        let handle = thread::spawn(move || server.run());
        Ok(Self {
            addr,
            shutdown,
            queue,
            handle: Some(handle),
        })
    }

    /// Shut down and wait for `run` to return.
    fn stop(mut self) -> Result<()> {
        self.shutdown.shutdown();
        let handle = self.handle.take().ok_or_else(|| anyhow!("server already stopped"))?;
        handle.join().map_err(|_| anyhow!("server thread panicked"))??;
        Ok(())
    }

    fn client(&self, directory: &str, output: &Path) -> ClientConfig {
        ClientConfig {
            server: self.addr.ip(),
            port: self.addr.port(),
            directory: directory.to_string(),
            output: output.to_path_buf(),
            read_size: 50,
        }
    }

    /// Send a request and return every byte the server writes back.
    fn raw(&self, request: &[u8]) -> Result<Vec<u8>> {
        let mut stream = TcpStream::connect(self.addr)?;
        stream.write_all(request)?;
        let mut buf = Vec::new();
        let _ = stream.read_to_end(&mut buf);
        Ok(buf)
    }
}

impl Drop for TestServer {
    fn drop(&mut self) {
        self.shutdown.shutdown();
        if let Some(handle) = self.handle.take() {
            let _ = handle.join();
        }
    }
}

#[test]
fn fetches_files_with_relative_names() -> Result<()> {
    let srv_root = tempfile::tempdir()?;
    let cli_dir = tempfile::tempdir()?;
    write_file(&srv_root.path().join("foo/a.txt"), 5)?;
    write_file(&srv_root.path().join("foo/bar/b.txt"), 0)?;

    let server = TestServer::start(srv_root.path(), 2, 4, 64)?;
    let output = cli_dir.path().join("output");
    let summary = fetch(&server.client("foo", &output), |_| {})?;

    let mut names: Vec<_> = summary
        .files
        .iter()
        .map(|f| (f.name.as_str(), f.size))
        .collect();
    names.sort();
    assert_eq!(names, [("foo/a.txt", 5), ("foo/bar/b.txt", 0)]);
    assert_eq!(
        std::fs::read(output.join("foo/a.txt"))?,
        std::fs::read(srv_root.path().join("foo/a.txt"))?
    );
    assert_eq!(std::fs::read(output.join("foo/bar/b.txt"))?, b"");
    Ok(())
}

#[test]
fn nested_request_strips_server_prefix() -> Result<()> {
    let srv_root = tempfile::tempdir()?;
    let cli_dir = tempfile::tempdir()?;
    write_file(&srv_root.path().join("data/projects/foo/x/y.bin"), 300)?;

    let server = TestServer::start(srv_root.path(), 1, 1, 16)?;
    let summary = fetch(&server.client("data/projects/foo", cli_dir.path()), |_| {})?;
    assert_eq!(summary.files.len(), 1);
    assert_eq!(summary.files[0].name, "foo/x/y.bin");
    assert!(cli_dir.path().join("foo/x/y.bin").is_file());
    Ok(())
}

#[test]
fn round_trip_reproduces_tree() -> Result<()> {
    let srv_root = tempfile::tempdir()?;
    let cli_dir = tempfile::tempdir()?;
    let tree = srv_root.path().join("tree");
    for i in 0..40 {
        let sub = format!("d{}/e{}", i % 5, i % 3);
        write_file(&tree.join(sub).join(format!("f{i}.dat")), i * 97)?;
    }
    write_file(&tree.join("big.bin"), 1_100_000)?;
    std::fs::create_dir_all(tree.join("empty/deeper"))?;

    let server = TestServer::start(srv_root.path(), 4, 3, 4096)?;
    let summary = fetch(&server.client("tree", cli_dir.path()), |_| {})?;
    assert_eq!(summary.files.len(), 41);

    assert_eq!(snapshot(&tree)?, snapshot(&cli_dir.path().join("tree"))?);
    Ok(())
}

#[test]
fn tiny_blocks_and_queue_still_deliver_everything() -> Result<()> {
    let srv_root = tempfile::tempdir()?;
    let cli_dir = tempfile::tempdir()?;
    write_file(&srv_root.path().join("foo/one"), 10)?;
    write_file(&srv_root.path().join("foo/two"), 257)?;
    write_file(&srv_root.path().join("foo/sub/three"), 33)?;

    let server = TestServer::start(srv_root.path(), 2, 1, 1)?;
    let summary = fetch(&server.client("foo", cli_dir.path()), |_| {})?;
    assert_eq!(summary.files.len(), 3);
    assert_eq!(summary.bytes, 300);
    assert_eq!(
        snapshot(&srv_root.path().join("foo"))?,
        snapshot(&cli_dir.path().join("foo"))?
    );
    Ok(())
}

#[test]
fn nonexistent_directory_closes_without_records() -> Result<()> {
    let srv_root = tempfile::tempdir()?;
    let cli_dir = tempfile::tempdir()?;
    let server = TestServer::start(srv_root.path(), 1, 1, 16)?;

    assert!(server.raw(b"missing\0")?.is_empty());

    let err = fetch(&server.client("missing", cli_dir.path()), |_| {}).unwrap_err();
    assert!(matches!(err, TransferError::ConnectionClosed));
    Ok(())
}

#[test]
fn empty_directory_gets_only_the_marker() -> Result<()> {
    let srv_root = tempfile::tempdir()?;
    std::fs::create_dir(srv_root.path().join("hollow"))?;
    let server = TestServer::start(srv_root.path(), 1, 1, 16)?;
    assert_eq!(server.raw(b"hollow\0")?, vec![0u8]);
    Ok(())
}

#[test]
fn serving_twice_is_byte_identical() -> Result<()> {
    let srv_root = tempfile::tempdir()?;
    for (i, name) in ["foo/a", "foo/b/c", "foo/b/d", "foo/e/f/g"].iter().enumerate() {
        write_file(&srv_root.path().join(name), 100 * i + 7)?;
    }
    // One worker keeps the record order stable.
    let server = TestServer::start(srv_root.path(), 1, 2, 13)?;
    let first = server.raw(b"foo\0")?;
    let second = server.raw(b"foo\0")?;
    assert!(!first.is_empty());
    assert_eq!(first.last(), Some(&0u8));
    assert_eq!(first, second);
    Ok(())
}

#[test]
fn concurrent_sessions_are_isolated() -> Result<()> {
    let srv_root = tempfile::tempdir()?;
    for dir in ["alpha", "beta", "gamma"] {
        for i in 0..15 {
            write_file(&srv_root.path().join(dir).join(format!("{i}.txt")), 50 + i * 31)?;
        }
    }
    let server = TestServer::start(srv_root.path(), 3, 2, 32)?;

    let outputs: Vec<(String, PathBuf, tempfile::TempDir)> = ["alpha", "beta", "gamma"]
        .iter()
        .map(|d| {
            let tmp = tempfile::tempdir().expect("tempdir");
            (d.to_string(), tmp.path().to_path_buf(), tmp)
        })
        .collect();

    let handles: Vec<_> = outputs
        .iter()
        .map(|(dir, out, _)| {
            let config = server.client(dir, out);
            thread::spawn(move || fetch(&config, |_| {}).map(|s| s.files.len()))
        })
        .collect();
    for handle in handles {
        assert_eq!(handle.join().expect("client thread")?, 15);
    }

    for (dir, out, _) in &outputs {
        assert_eq!(snapshot(&srv_root.path().join(dir))?, snapshot(&out.join(dir))?);
        // Nothing from another session leaked into this output.
        assert_eq!(std::fs::read_dir(out)?.count(), 1);
    }
    Ok(())
}

#[test]
fn malformed_request_is_dropped() -> Result<()> {
    let srv_root = tempfile::tempdir()?;
    write_file(&srv_root.path().join("foo/a"), 3)?;
    let server = TestServer::start(srv_root.path(), 1, 1, 16)?;
    assert!(server.raw(b"../foo\0")?.is_empty());
    assert!(server.raw(b"/etc\0")?.is_empty());
    Ok(())
}

#[test]
fn shutdown_serves_queued_tasks_and_stops_the_server() -> Result<()> {
    const FILE_LEN: usize = 8 * 1024 * 1024;
    let srv_root = tempfile::tempdir()?;
    for name in ["a.bin", "b.bin", "c.bin", "d.bin"] {
        write_file(&srv_root.path().join("big").join(name), FILE_LEN)?;
    }
    let server = TestServer::start(srv_root.path(), 1, 1, 64 * 1024)?;

    // Nobody reads yet, so the only worker stalls on the socket and the
    // walk can never get past the full queue.
    let mut stream = TcpStream::connect(server.addr)?;
    stream.write_all(b"big\0")?;
    let deadline = Instant::now() + Duration::from_secs(10);
    while server.queue.is_empty() {
        assert!(Instant::now() < deadline, "no task was queued");
        thread::sleep(Duration::from_millis(10));
    }
    server.shutdown.shutdown();

    let mut bytes = Vec::new();
    stream.read_to_end(&mut bytes)?;
    let mut decoder = ResponseDecoder::new();
    let mut files = Vec::new();
    let mut current: Option<(String, usize)> = None;
    decoder.feed(&bytes, |frame| {
        match frame {
            Frame::Header(h) => current = Some((h.name, 0)),
            Frame::Contents(d) => {
                if let Some((_, len)) = current.as_mut() {
                    *len += d.len();
                }
            }
            Frame::EndOfFile => files.extend(current.take()),
            Frame::Complete => {}
        }
        Ok(())
    })?;

    // Whatever was queued at shutdown is delivered whole; the rest never
    // starts, and the session ends without a completion marker.
    assert!(!decoder.is_done());
    assert!(current.is_none());
    assert!(!files.is_empty() && files.len() < 4, "{files:?}");
    for (i, (name, len)) in files.iter().enumerate() {
        assert_eq!(name, &format!("big/{}.bin", ["a", "b", "c"][i]));
        assert_eq!(*len, FILE_LEN);
    }

    server.stop()
}
