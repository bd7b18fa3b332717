//! Fixtures shared by the unit tests: throwaway git repositories, tar
//! archives and a one-shot HTTP server on the loopback interface.

use flate2::write::GzEncoder;
use flate2::Compression;
use std::fs::{self, File};
use std::io::{Read, Write};
use std::net::{TcpListener, TcpStream};
use std::path::{Path, PathBuf};
use std::process::Command;
use std::thread::{self, JoinHandle};
use std::time::Duration;

fn git(dir: &Path, args: &[&str]) -> String {
    let output = Command::new("git")
        .args(["-c", "user.name=Test", "-c", "user.email=test@example.com"])
        .args(["-c", "commit.gpgsign=false", "-c", "init.defaultBranch=master"])
        .arg("-C")
        .arg(dir)
        .args(args)
        .output()
        .expect("git must be installed to run these tests");
    assert!(
        output.status.success(),
        "git {:?} failed: {}",
        args,
        String::from_utf8_lossy(&output.stderr)
    );
    String::from_utf8_lossy(&output.stdout).trim().to_string()
}

/// Create a repository at `dir` with one commit on `branch`.
pub fn init_repo(dir: &Path, branch: &str) -> PathBuf {
    fs::create_dir_all(dir).unwrap();
    git(dir, &["init", "-q"]);
    git(dir, &["symbolic-ref", "HEAD", &format!("refs/heads/{branch}")]);
    commit_file(dir, "README", "initial");
    dir.to_path_buf()
}

/// Write `name` with `contents` and commit it.
pub fn commit_file(repo: &Path, name: &str, contents: &str) {
    fs::write(repo.join(name), contents).unwrap();
    git(repo, &["add", name]);
    git(repo, &["commit", "-q", "-m", &format!("add {name}")]);
}

pub fn current_branch(repo: &Path) -> String {
    git(repo, &["rev-parse", "--abbrev-ref", "HEAD"])
}

/// Raw HTTP/1.1 response with `Content-Length` and `Connection: close`.
pub fn http_response(status: &str, headers: &[(&str, &str)], body: &[u8]) -> Vec<u8> {
    let mut head = format!(
        "HTTP/1.1 {status}\r\nContent-Length: {}\r\nConnection: close\r\n",
        body.len()
    );
    for (name, value) in headers {
        head.push_str(&format!("{name}: {value}\r\n"));
    }
    head.push_str("\r\n");
    let mut out = head.into_bytes();
    out.extend_from_slice(body);
    out
}

fn read_request_head(stream: &mut TcpStream) -> String {
    let mut request = Vec::new();
    let mut buf = [0u8; 1024];
    while !request.windows(4).any(|w| w == b"\r\n\r\n") {
        let n = stream.read(&mut buf).unwrap();
        if n == 0 {
            break;
        }
        request.extend_from_slice(&buf[..n]);
    }
    String::from_utf8_lossy(&request).into_owned()
}

/// Answer one connection per entry of `responses`, in order. The join
/// handle yields the request heads as received.
pub fn serve(responses: Vec<Vec<u8>>) -> (String, JoinHandle<Vec<String>>) {
    let listener = TcpListener::bind("127.0.0.1:0").unwrap();
    let url = format!("http://{}/aosp_clang.tar.gz", listener.local_addr().unwrap());
    let handle = thread::spawn(move || {
        let mut requests = Vec::new();
        for response in responses {
            let (mut stream, _) = listener.accept().unwrap();
            requests.push(read_request_head(&mut stream));
            stream.write_all(&response).unwrap();
            stream.flush().unwrap();
        }
        requests
    });
    (url, handle)
}

/// Answer exactly one request with `response`. The join handle yields the
/// request head as received.
pub fn serve_once(response: Vec<u8>) -> (String, JoinHandle<String>) {
    let (url, handle) = serve(vec![response]);
    let handle = thread::spawn(move || handle.join().unwrap().remove(0));
    (url, handle)
}

/// Send `partial` (a head plus less body than it announces) and then keep
/// the connection open without writing for `hold`.
pub fn serve_then_stall(partial: Vec<u8>, hold: Duration) -> String {
    let listener = TcpListener::bind("127.0.0.1:0").unwrap();
    let url = format!("http://{}/aosp_clang.tar.gz", listener.local_addr().unwrap());
    thread::spawn(move || {
        let (mut stream, _) = listener.accept().unwrap();
        read_request_head(&mut stream);
        stream.write_all(&partial).unwrap();
        stream.flush().unwrap();
        thread::sleep(hold);
    });
    url
}

/// URL of a loopback port nothing listens on.
pub fn unused_local_url() -> String {
    let listener = TcpListener::bind("127.0.0.1:0").unwrap();
    let addr = listener.local_addr().unwrap();
    drop(listener);
    format!("http://{addr}/missing.tar.gz")
}

fn append_files<W: Write>(builder: &mut tar::Builder<W>, files: &[(&str, &str)]) {
    for (name, contents) in files {
        let mut header = tar::Header::new_gnu();
        header.set_entry_type(tar::EntryType::Regular);
        header.set_size(contents.len() as u64);
        header.set_mode(0o755);
        header.set_mtime(0);
        header.set_cksum();
        builder
            .append_data(&mut header, name, contents.as_bytes())
            .unwrap();
    }
}

/// Write a gzip-compressed tarball of `files` (path, contents) to `path`.
pub fn tar_gz(path: &Path, files: &[(&str, &str)]) {
    let encoder = GzEncoder::new(File::create(path).unwrap(), Compression::default());
    let mut builder = tar::Builder::new(encoder);
    append_files(&mut builder, files);
    builder.into_inner().unwrap().finish().unwrap();
}

pub fn tar_zst(path: &Path, files: &[(&str, &str)]) {
    let encoder = zstd::stream::Encoder::new(File::create(path).unwrap(), 3).unwrap();
    let mut builder = tar::Builder::new(encoder);
    append_files(&mut builder, files);
    builder.into_inner().unwrap().finish().unwrap();
}
