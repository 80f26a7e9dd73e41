//! Remote client: requests a directory and rebuilds it locally
//!
//! Received names are created under the output directory, missing
//! parents are created, existing files are overwritten and a
//! non-directory standing where a parent directory is needed is replaced.

use std::fs::{self, File};
use std::io::{self, BufWriter, Read, Write};
use std::net::{IpAddr, SocketAddr, TcpStream};
use std::path::{Component, Path, PathBuf};
use tracing::{debug, info};

use crate::codec::{write_request, FileHeader, Frame, ResponseDecoder};
use crate::error::{Result, TransferError};

/// Validated client settings
#[derive(Debug, Clone)]
pub struct ClientConfig {
    pub server: IpAddr,
    pub port: u16,
    /// Directory to request, relative to the server's root
    pub directory: String,
    /// Local directory the tree is rebuilt under
    pub output: PathBuf,
    pub read_size: usize,
}

impl ClientConfig {
    pub fn validate(&self) -> Result<()> {
        validate_directory(&self.directory)?;
        if self.read_size == 0 {
            return Err(TransferError::Io(io::Error::new(
                io::ErrorKind::InvalidInput,
                "read_size must be at least 1",
            )));
        }
        Ok(())
    }

    pub fn server_addr(&self) -> SocketAddr {
        SocketAddr::new(self.server, self.port)
    }
}

fn validate_directory(directory: &str) -> Result<()> {
    if directory.is_empty() {
        return Err(TransferError::MalformedRequest("empty directory".into()));
    }
    if directory.ends_with('/') {
        return Err(TransferError::MalformedRequest(format!(
            "directory must not end with '/': {directory}"
        )));
    }
    Ok(())
}

/// One file written under the output directory
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReceivedFile {
    pub name: String,
    pub size: u32,
}

#[derive(Debug, Default, Clone)]
pub struct FetchSummary {
    pub files: Vec<ReceivedFile>,
    pub bytes: u64,
}

/// Connect to the server and fetch `config.directory`.
///
/// `on_file` runs after each file is fully written.
pub fn fetch<F>(config: &ClientConfig, on_file: F) -> Result<FetchSummary>
where
    F: FnMut(&ReceivedFile),
{
    config.validate()?;
    let addr = config.server_addr();
    let mut stream = TcpStream::connect(addr)?;
    if let Err(e) = stream.set_nodelay(true) {
        debug!(error = %e, "failed to set TCP_NODELAY");
    }
    info!(%addr, directory = %config.directory, "connected");
    fetch_from(
        &mut stream,
        &config.directory,
        &config.output,
        config.read_size,
        on_file,
    )
}

/// Request `directory` over an established stream and rebuild it under `output`.
pub fn fetch_from<S, F>(
    stream: &mut S,
    directory: &str,
    output: &Path,
    read_size: usize,
    mut on_file: F,
) -> Result<FetchSummary>
where
    S: Read + Write + ?Sized,
    F: FnMut(&ReceivedFile),
{
    validate_directory(directory)?;
    write_request(stream, directory)?;

    let tree = OutputTree::new(output)?;
    let mut decoder = ResponseDecoder::new();
    let mut summary = FetchSummary::default();
    let mut current: Option<OpenFile> = None;
    let mut buf = vec![0u8; read_size.max(1)];

    while !decoder.is_done() {
        let n = match stream.read(&mut buf) {
            Ok(0) => break,
            Ok(n) => n,
            Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
            Err(e) if e.kind() == io::ErrorKind::ConnectionReset => {
                return Err(TransferError::ConnectionClosed)
            }
            Err(e) => return Err(e.into()),
        };
        decoder.feed(&buf[..n], |frame| {
            match frame {
                Frame::Header(header) => {
                    current = Some(tree.create(header)?);
                }
                Frame::Contents(data) => {
                    if let Some(open) = current.as_mut() {
                        open.write(data)?;
                    }
                }
                Frame::EndOfFile => {
                    if let Some(open) = current.take() {
                        let received = open.finish()?;
                        debug!(file = %received.name, size = received.size, "file received");
                        summary.bytes += received.size as u64;
                        on_file(&received);
                        summary.files.push(received);
                    }
                }
                Frame::Complete => {}
            }
            Ok(())
        })?;
    }
    decoder.finish()?;

    info!(
        files = summary.files.len(),
        bytes = summary.bytes,
        output = %output.display(),
        "transfer complete"
    );
    Ok(summary)
}

struct OpenFile {
    path: PathBuf,
    header: FileHeader,
    writer: BufWriter<File>,
}

impl OpenFile {
    fn write(&mut self, data: &[u8]) -> Result<()> {
        self.writer
            .write_all(data)
            .map_err(|e| TransferError::filesystem(&self.path, e))
    }

    fn finish(mut self) -> Result<ReceivedFile> {
        self.writer
            .flush()
            .map_err(|e| TransferError::filesystem(&self.path, e))?;
        Ok(ReceivedFile {
            name: self.header.name,
            size: self.header.size,
        })
    }
}

/// Output directory the received tree is rebuilt under
struct OutputTree {
    root: PathBuf,
}

impl OutputTree {
    fn new(root: &Path) -> Result<Self> {
        fs::create_dir_all(root).map_err(|e| TransferError::filesystem(root, e))?;
        Ok(Self {
            root: root.to_path_buf(),
        })
    }

    fn create(&self, header: FileHeader) -> Result<OpenFile> {
        let rel = validate_received_name(&header.name)?;
        let path = self.root.join(&rel);
        if let Some(parent) = rel.parent() {
            self.ensure_dirs(parent)?;
        }
        let file = File::create(&path).map_err(|e| TransferError::filesystem(&path, e))?;
        Ok(OpenFile {
            path,
            header,
            writer: BufWriter::new(file),
        })
    }

    /// Create each directory of `rel` under the root, replacing anything
    /// that is in the way.
    fn ensure_dirs(&self, rel: &Path) -> Result<()> {
        let mut dir = self.root.clone();
        for component in rel.components() {
            dir.push(component);
            match fs::symlink_metadata(&dir) {
                Ok(meta) if meta.is_dir() => {}
                Ok(_) => {
                    fs::remove_file(&dir).map_err(|e| TransferError::filesystem(&dir, e))?;
                    fs::create_dir(&dir).map_err(|e| TransferError::filesystem(&dir, e))?;
                }
                Err(e) if e.kind() == io::ErrorKind::NotFound => {
                    fs::create_dir(&dir).map_err(|e| TransferError::filesystem(&dir, e))?;
                }
                Err(e) => return Err(TransferError::filesystem(&dir, e)),
            }
        }
        Ok(())
    }
}

/// Reject names that would land outside the output directory.
fn validate_received_name(name: &str) -> Result<PathBuf> {
    if name.is_empty() {
        return Err(TransferError::InvalidPath("empty path".into()));
    }
    let path = Path::new(name);
    let mut rel = PathBuf::new();
    for component in path.components() {
        match component {
            Component::Normal(c) => rel.push(c),
            Component::CurDir => {}
            Component::ParentDir => {
                return Err(TransferError::InvalidPath(format!(
                    "parent traversal not allowed: {name}"
                )));
            }
            Component::RootDir | Component::Prefix(_) => {
                return Err(TransferError::InvalidPath(format!(
                    "absolute path not allowed: {name}"
                )));
            }
        }
    }
    if rel.as_os_str().is_empty() {
        return Err(TransferError::InvalidPath(format!("no file name in: {name}")));
    }
    Ok(rel)
}
