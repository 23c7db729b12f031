//! A one-request-per-connection HTTP server that plays back canned replies.

use std::io::{BufRead, BufReader, Write};
use std::net::TcpListener;
use std::sync::{Arc, Mutex};
use std::thread;

pub(crate) struct Reply {
    status: &'static str,
    content_length: usize,
    body: Vec<u8>,
}

impl Reply {
    pub(crate) fn new(status: &'static str, body: &[u8]) -> Self {
        Self {
            status,
            content_length: body.len(),
            body: body.to_vec(),
        }
    }

    /// Announces `len` bytes but sends only the body, then hangs up.
    pub(crate) fn truncated(status: &'static str, body: &[u8], len: usize) -> Self {
        Self {
            content_length: len,
            ..Self::new(status, body)
        }
    }

    fn to_bytes(&self) -> Vec<u8> {
        let mut out = format!(
            "HTTP/1.1 {}\r\nContent-Length: {}\r\nConnection: close\r\n\r\n",
            self.status, self.content_length
        )
        .into_bytes();
        out.extend_from_slice(&self.body);
        out
    }
}

pub(crate) struct ScriptedServer {
    base: String,
    requests: Arc<Mutex<Vec<Vec<String>>>>,
}

impl ScriptedServer {
    pub(crate) fn start(replies: Vec<Reply>) -> Self {
        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        let base = format!("http://{}", listener.local_addr().unwrap());
        let requests = Arc::new(Mutex::new(Vec::new()));
        let seen = Arc::clone(&requests);
        thread::spawn(move || {
            for reply in replies {
                let (mut stream, _) = listener.accept().unwrap();
                let mut reader = BufReader::new(stream.try_clone().unwrap());
                let mut head = Vec::new();
                loop {
                    let mut line = String::new();
                    if reader.read_line(&mut line).unwrap() == 0 {
                        break;
                    }
                    let line = line.trim_end().to_string();
                    if line.is_empty() {
                        break;
                    }
                    head.push(line);
                }
                seen.lock().unwrap().push(head);
                stream.write_all(&reply.to_bytes()).unwrap();
                stream.flush().unwrap();
            }
        });
        Self { base, requests }
    }

    pub(crate) fn base(&self) -> &str {
        &self.base
    }

    pub(crate) fn url(&self, path: &str) -> String {
        format!("{}{}", self.base, path)
    }

    pub(crate) fn hits(&self) -> usize {
        self.requests.lock().unwrap().len()
    }

    /// Value of header `name` on the `n`th request received.
    pub(crate) fn header(&self, n: usize, name: &str) -> Option<String> {
        let requests = self.requests.lock().unwrap();
        requests.get(n)?.iter().skip(1).find_map(|line| {
            let (k, v) = line.split_once(':')?;
            k.trim().eq_ignore_ascii_case(name).then(|| v.trim().to_string())
        })
    }
}
