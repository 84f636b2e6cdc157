pub(crate) mod protocol;

use crate::options::ServerOptions;
use crate::store::{Error, IndexId, IndexSpec, IndexedStore, Op, Row};
use std::time::Duration;
use tokio::io::{AsyncBufReadExt, AsyncReadExt, AsyncWriteExt, BufReader, BufWriter};
use tokio::net::TcpStream;
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::sync::Mutex;

/// Default cap on one response line.
pub const DEFAULT_MAX_RESPONSE: u64 = 16 * 1024 * 1024;

/// A client for the MySQL HandlerSocket plugin.
///
/// The protocol allows one outstanding request per connection, so requests
/// are serialised through an async mutex and the client can be shared behind
/// an `Arc` by concurrent sessions.
///
/// A request that does not complete (I/O error, timeout, or the caller's
/// future dropped mid-exchange) may leave an unread response on the wire; the
/// connection is then out of sync and every further request fails with
/// [`Error::Protocol`]. There is no reconnect.
#[derive(Debug)]
pub struct HandlerSocket {
    conn: Mutex<Connection>,
    io_timeout: Option<Duration>,
}

#[derive(Debug)]
struct Connection {
    reader: BufReader<OwnedReadHalf>,
    writer: BufWriter<OwnedWriteHalf>,
    // set for the whole exchange, cleared once a full response line is in
    out_of_sync: bool,
    max_response: u64,
}

impl HandlerSocket {
    /// Connects to `host:port`, honouring the configured connect timeout.
    #[tracing::instrument(name = "connecting to handlersocket", skip(options), fields(host = %options.host, port = options.port))]
    pub async fn connect(options: &ServerOptions) -> Result<Self, Error> {
        let addr = (options.host.as_str(), options.port);
        let stream = match options.connect_timeout {
            Some(limit) => tokio::time::timeout(limit, TcpStream::connect(addr))
                .await
                .map_err(|_| Error::Timeout(limit))??,
            None => TcpStream::connect(addr).await?,
        };
        stream.set_nodelay(true)?;

        Ok(Self::from_stream(stream, options.io_timeout).with_max_response(options.max_response))
    }

    /// Wraps an already connected stream.
    pub fn from_stream(stream: TcpStream, io_timeout: Option<Duration>) -> Self {
        let (reader, writer) = stream.into_split();
        Self {
            conn: Mutex::new(Connection {
                reader: BufReader::new(reader),
                writer: BufWriter::new(writer),
                out_of_sync: false,
                max_response: DEFAULT_MAX_RESPONSE,
            }),
            io_timeout,
        }
    }

    /// Caps the length of one response line. Longer responses fail the
    /// request with [`Error::Protocol`].
    pub fn with_max_response(mut self, bytes: u64) -> Self {
        self.conn.get_mut().max_response = bytes;
        self
    }

    async fn execute(&self, request: Vec<u8>) -> Result<protocol::Response, Error> {
        let mut conn = self.conn.lock().await;
        if conn.out_of_sync {
            return Err(Error::Protocol(
                "connection is out of sync after an earlier failure".to_string(),
            ));
        }

        tracing::debug!(size = request.len(), "sending handlersocket request");
        conn.out_of_sync = true;
        let line = match self.io_timeout {
            Some(limit) => tokio::time::timeout(limit, conn.exchange(&request))
                .await
                .unwrap_or(Err(Error::Timeout(limit)))?,
            None => conn.exchange(&request).await?,
        };
        conn.out_of_sync = false;

        tracing::debug!(size = line.len(), "received handlersocket response");
        protocol::parse_response(&line)
    }
}

impl Connection {
    async fn exchange(&mut self, request: &[u8]) -> Result<Vec<u8>, Error> {
        self.writer.write_all(request).await?;
        self.writer.flush().await?;

        let mut line = Vec::new();
        (&mut self.reader)
            .take(self.max_response)
            .read_until(protocol::EOL, &mut line)
            .await?;
        if line.last() != Some(&protocol::EOL) && line.len() as u64 >= self.max_response {
            return Err(Error::Protocol(format!(
                "response line exceeds {} bytes",
                self.max_response
            )));
        }
        if line.pop() != Some(protocol::EOL) {
            return Err(Error::Io(std::io::Error::new(
                std::io::ErrorKind::UnexpectedEof,
                "connection closed before a full response was read",
            )));
        }

        Ok(line)
    }
}

impl IndexedStore for HandlerSocket {
    async fn open_index(&self, id: IndexId, spec: &IndexSpec<'_>) -> Result<(), Error> {
        match self.execute(protocol::open_index(id, spec)).await {
            Ok(_) => Ok(()),
            Err(Error::Server { code, message }) => {
                tracing::error!(
                    code,
                    reason = %message,
                    index = spec.index,
                    "failed to open index"
                );
                Err(spec.missing())
            }
            Err(err) => Err(err),
        }
    }

    async fn find(
        &self,
        id: IndexId,
        op: Op,
        keys: &[&[u8]],
        limit: u32,
        offset: u32,
    ) -> Result<Vec<Row>, Error> {
        self.execute(protocol::find(id, op, keys, limit, offset))
            .await?
            .into_rows()
    }

    async fn insert(&self, id: IndexId, values: &[&[u8]]) -> Result<(), Error> {
        self.execute(protocol::insert(id, values)).await?;
        Ok(())
    }

    async fn update(
        &self,
        id: IndexId,
        op: Op,
        keys: &[&[u8]],
        values: &[&[u8]],
        limit: u32,
        offset: u32,
    ) -> Result<u64, Error> {
        self.execute(protocol::update(id, op, keys, values, limit, offset))
            .await?
            .affected_rows()
    }

    async fn delete(
        &self,
        id: IndexId,
        op: Op,
        keys: &[&[u8]],
        limit: u32,
        offset: u32,
    ) -> Result<u64, Error> {
        self.execute(protocol::delete(id, op, keys, limit, offset))
            .await?
            .affected_rows()
    }
}
