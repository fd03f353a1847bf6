//! Minimal memcached text-protocol client (`get`, `set`, `delete`,
//! `version`). Keys are spread over the configured servers by hash; each
//! server keeps one lazily opened connection.

use async_trait::async_trait;
use std::collections::hash_map::DefaultHasher;
use std::hash::{Hash, Hasher};
use std::time::Duration;
use tokio::io::{AsyncBufReadExt, AsyncReadExt, AsyncWriteExt, BufReader};
use tokio::net::TcpStream;
use tokio::sync::Mutex;

use super::{CacheError, CacheResult, UrlCache};

/// memcached treats larger relative expirations as absolute timestamps
const MAX_RELATIVE_EXPIRY: u64 = 60 * 60 * 24 * 30;
const MAX_KEY_LEN: usize = 250;

struct Server {
    addr: String,
    conn: Mutex<Option<BufReader<TcpStream>>>,
}

pub struct MemcachedCache {
    servers: Vec<Server>,
    timeout: Duration,
}

enum Command<'a> {
    Get(&'a str),
    Set {
        key: &'a str,
        value: &'a str,
        exptime: u64,
    },
    Delete(&'a str),
    Version,
}

#[derive(Debug, PartialEq)]
enum Reply {
    Value(Option<String>),
    Stored,
    Deleted,
    NotFound,
    Version(String),
}

impl Command<'_> {
    fn encode(&self) -> Vec<u8> {
        match self {
            Command::Get(key) => format!("get {key}\r\n").into_bytes(),
            Command::Set {
                key,
                value,
                exptime,
            } => format!("set {key} 0 {exptime} {}\r\n{value}\r\n", value.len()).into_bytes(),
            Command::Delete(key) => format!("delete {key}\r\n").into_bytes(),
            Command::Version => b"version\r\n".to_vec(),
        }
    }

    async fn read_reply(&self, stream: &mut BufReader<TcpStream>) -> CacheResult<Reply> {
        let line = read_line(stream).await?;
        check_error_line(&line)?;

        match self {
            Command::Get(_) => {
                if line == "END" {
                    return Ok(Reply::Value(None));
                }
                // VALUE <key> <flags> <bytes>
                let len: usize = line
                    .strip_prefix("VALUE ")
                    .and_then(|rest| rest.split_whitespace().nth(2))
                    .and_then(|n| n.parse().ok())
                    .ok_or_else(|| CacheError::Protocol(format!("unexpected get reply: {line}")))?;

                let mut data = vec![0u8; len + 2];
                stream.read_exact(&mut data).await?;
                data.truncate(len);
                let value = String::from_utf8(data)
                    .map_err(|_| CacheError::Protocol("value is not utf-8".to_string()))?;

                let end = read_line(stream).await?;
                if end != "END" {
                    return Err(CacheError::Protocol(format!("missing END, got: {end}")));
                }
                Ok(Reply::Value(Some(value)))
            }
            Command::Set { .. } => match line.as_str() {
                "STORED" => Ok(Reply::Stored),
                other => Err(CacheError::Protocol(format!("set failed: {other}"))),
            },
            Command::Delete(_) => match line.as_str() {
                "DELETED" => Ok(Reply::Deleted),
                "NOT_FOUND" => Ok(Reply::NotFound),
                other => Err(CacheError::Protocol(format!("delete failed: {other}"))),
            },
            Command::Version => line
                .strip_prefix("VERSION ")
                .map(|v| Reply::Version(v.to_string()))
                .ok_or_else(|| CacheError::Protocol(format!("unexpected version reply: {line}"))),
        }
    }
}

async fn read_line(stream: &mut BufReader<TcpStream>) -> CacheResult<String> {
    let mut line = String::new();
    if stream.read_line(&mut line).await? == 0 {
        return Err(CacheError::Protocol("connection closed".to_string()));
    }
    Ok(line.trim_end_matches(['\r', '\n']).to_string())
}

fn check_error_line(line: &str) -> CacheResult<()> {
    if line == "ERROR" || line.starts_with("CLIENT_ERROR") || line.starts_with("SERVER_ERROR") {
        return Err(CacheError::Protocol(line.to_string()));
    }
    Ok(())
}

fn check_key(key: &str) -> CacheResult<()> {
    if key.is_empty()
        || key.len() > MAX_KEY_LEN
        || key.bytes().any(|b| b.is_ascii_whitespace() || b.is_ascii_control())
    {
        return Err(CacheError::Protocol(format!("malformed key {key:?}")));
    }
    Ok(())
}

impl MemcachedCache {
    pub fn new(servers: Vec<String>, timeout: Duration) -> anyhow::Result<Self> {
        if servers.is_empty() {
            anyhow::bail!("memcached cache needs at least one server");
        }
        Ok(Self {
            servers: servers
                .into_iter()
                .map(|addr| Server {
                    addr,
                    conn: Mutex::new(None),
                })
                .collect(),
            timeout,
        })
    }

    fn pick(&self, key: &str) -> &Server {
        let mut hasher = DefaultHasher::new();
        key.hash(&mut hasher);
        &self.servers[(hasher.finish() % self.servers.len() as u64) as usize]
    }

    async fn exec(&self, server: &Server, command: Command<'_>) -> CacheResult<Reply> {
        let mut conn = server.conn.lock().await;
        // The connection is only put back after a clean exchange; errors
        // and timeouts drop it so the next call reconnects.
        let stream = conn.take();
        let exchange = async {
            let mut stream = match stream {
                Some(stream) => stream,
                None => BufReader::new(TcpStream::connect(&server.addr).await?),
            };
            stream.get_mut().write_all(&command.encode()).await?;
            let reply = command.read_reply(&mut stream).await?;
            Ok::<_, CacheError>((stream, reply))
        };

        let (stream, reply) = tokio::time::timeout(self.timeout, exchange)
            .await
            .map_err(|_| CacheError::Timeout)??;
        *conn = Some(stream);
        Ok(reply)
    }

    async fn set(&self, key: &str, value: &str, exptime: u64) -> CacheResult<()> {
        check_key(key)?;
        self.exec(
            self.pick(key),
            Command::Set {
                key,
                value,
                exptime,
            },
        )
        .await?;
        Ok(())
    }
}

#[async_trait]
impl UrlCache for MemcachedCache {
    fn name(&self) -> &'static str {
        "memcached"
    }

    async fn load(&self, short_code: &str) -> CacheResult<Option<String>> {
        check_key(short_code)?;
        match self.exec(self.pick(short_code), Command::Get(short_code)).await? {
            Reply::Value(value) => Ok(value),
            other => Err(CacheError::Protocol(format!("unexpected reply {other:?}"))),
        }
    }

    async fn store(&self, short_code: &str, long_url: &str) -> CacheResult<()> {
        self.set(short_code, long_url, 0).await
    }

    async fn store_exp(&self, short_code: &str, long_url: &str, ttl: Duration) -> CacheResult<()> {
        let exptime = ttl.as_secs().clamp(1, MAX_RELATIVE_EXPIRY);
        self.set(short_code, long_url, exptime).await
    }

    async fn delete(&self, short_code: &str) -> CacheResult<()> {
        check_key(short_code)?;
        self.exec(self.pick(short_code), Command::Delete(short_code))
            .await?;
        Ok(())
    }

    async fn range(
        &self,
        _f: &mut (dyn for<'a, 'b> FnMut(&'a str, &'b str) -> bool + Send),
    ) -> CacheResult<()> {
        Err(CacheError::Unsupported("memcached"))
    }

    async fn ping(&self) -> CacheResult<()> {
        for server in &self.servers {
            self.exec(server, Command::Version).await?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;
    use std::sync::Arc;
    use tokio::net::TcpListener;

    /// Just enough of memcached to exercise the client
    async fn spawn_fake_server() -> (String, Arc<std::sync::Mutex<HashMap<String, String>>>) {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap().to_string();
        let store: Arc<std::sync::Mutex<HashMap<String, String>>> = Arc::default();

        let shared = Arc::clone(&store);
        tokio::spawn(async move {
            loop {
                let Ok((socket, _)) = listener.accept().await else {
                    return;
                };
                let store = Arc::clone(&shared);
                tokio::spawn(async move {
                    let (read, mut write) = socket.into_split();
                    let mut reader = BufReader::new(read);
                    loop {
                        let mut line = String::new();
                        if reader.read_line(&mut line).await.unwrap_or(0) == 0 {
                            return;
                        }
                        let parts: Vec<String> =
                            line.split_whitespace().map(str::to_string).collect();
                        let reply = match parts.first().map(String::as_str) {
                            Some("get") => match store.lock().unwrap().get(&parts[1]) {
                                Some(v) => {
                                    format!("VALUE {} 0 {}\r\n{}\r\nEND\r\n", parts[1], v.len(), v)
                                }
                                None => "END\r\n".to_string(),
                            },
                            Some("set") => {
                                let len: usize = parts[4].parse().unwrap();
                                let mut data = vec![0u8; len + 2];
                                reader.read_exact(&mut data).await.unwrap();
                                data.truncate(len);
                                store
                                    .lock()
                                    .unwrap()
                                    .insert(parts[1].clone(), String::from_utf8(data).unwrap());
                                "STORED\r\n".to_string()
                            }
                            Some("delete") => match store.lock().unwrap().remove(&parts[1]) {
                                Some(_) => "DELETED\r\n".to_string(),
                                None => "NOT_FOUND\r\n".to_string(),
                            },
                            Some("version") => "VERSION 1.6.21\r\n".to_string(),
                            _ => "ERROR\r\n".to_string(),
                        };
                        if write.write_all(reply.as_bytes()).await.is_err() {
                            return;
                        }
                    }
                });
            }
        });

        (addr, store)
    }

    #[tokio::test]
    async fn test_roundtrip_against_fake_server() {
        let (addr, store) = spawn_fake_server().await;
        let cache = MemcachedCache::new(vec![addr], Duration::from_secs(1)).unwrap();

        cache.ping().await.unwrap();
        assert_eq!(cache.load("abc12").await.unwrap(), None);

        cache.store("abc12", "https://ex.com/p?q=1 2").await.unwrap();
        assert_eq!(
            cache.load("abc12").await.unwrap().as_deref(),
            Some("https://ex.com/p?q=1 2")
        );
        assert_eq!(store.lock().unwrap().len(), 1);

        cache
            .store_exp("ttl01", "https://ex.org", Duration::from_secs(60))
            .await
            .unwrap();
        assert_eq!(cache.load("ttl01").await.unwrap().as_deref(), Some("https://ex.org"));

        cache.delete("abc12").await.unwrap();
        cache.delete("abc12").await.unwrap();
        assert_eq!(cache.load("abc12").await.unwrap(), None);
    }

    #[tokio::test]
    async fn test_range_is_unsupported() {
        let (addr, _) = spawn_fake_server().await;
        let cache = MemcachedCache::new(vec![addr], Duration::from_secs(1)).unwrap();
        let err = cache.range(&mut |_, _| true).await.unwrap_err();
        assert!(matches!(err, CacheError::Unsupported("memcached")));
    }

    #[tokio::test]
    async fn test_unreachable_server_errors() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap().to_string();
        drop(listener);

        let cache = MemcachedCache::new(vec![addr], Duration::from_millis(200)).unwrap();
        assert!(cache.load("abc12").await.is_err());
        assert!(cache.ping().await.is_err());
    }

    #[test]
    fn test_rejects_malformed_keys() {
        assert!(check_key("abc12").is_ok());
        assert!(check_key("a b").is_err());
        assert!(check_key("").is_err());
        assert!(check_key(&"x".repeat(251)).is_err());
    }

    #[test]
    fn test_requires_a_server() {
        assert!(MemcachedCache::new(Vec::new(), Duration::from_secs(1)).is_err());
    }
}
