//! Wire response writer: fixed-16 and unbuffered framing around the
//! plain and wrapped JSON envelopes.

use std::io::{self, Write};

use heron_common::error::WriteError;
use heron_data::catalog::PeerLockMode;

use crate::response::Response;

/// Counting writer so unbuffered responses can report their size for
/// the byte metrics.
pub struct WriteCounter<'a, W: Write + ?Sized> {
    inner: &'a mut W,
    pub count: u64,
}

impl<'a, W: Write + ?Sized> WriteCounter<'a, W> {
    pub fn new(inner: &'a mut W) -> Self {
        Self { inner, count: 0 }
    }
}

impl<W: Write + ?Sized> Write for WriteCounter<'_, W> {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        let n = self.inner.write(buf)?;
        self.count += n as u64;
        Ok(n)
    }

    fn flush(&mut self) -> io::Result<()> {
        self.inner.flush()
    }
}

impl Response {
    /// Serialize the response onto the connection in the requested
    /// framing and account the bytes sent.
    pub fn send<W: Write + ?Sized>(&self, w: &mut W) -> Result<u64, WriteError> {
        let size = if self.request.response_fixed16 {
            self.send_fixed16(w)?
        } else {
            self.send_unbuffered(w)?
        };
        heron_observability::record_response_bytes(size + 1);
        Ok(size)
    }

    /// Render the whole body first, then emit the
    /// `"{code} {len+1:>11}\n"` header, the body and a trailing
    /// newline. The announced length must match to the byte.
    pub fn send_fixed16<W: Write + ?Sized>(&self, w: &mut W) -> Result<u64, WriteError> {
        let body = self.buffer()?;
        let announced = body.len() as u64 + 1;
        let header = format!("{} {:>11}\n", self.code, announced);
        tracing::trace!(header = %header.trim_end(), "writing fixed16 response");
        w.write_all(header.as_bytes())?;

        let mut counter = WriteCounter::new(w);
        counter.write_all(&body)?;
        let written = counter.count;
        if written != body.len() as u64 {
            return Err(WriteError::LengthMismatch {
                announced,
                written: written + 1,
            });
        }
        w.write_all(b"\n")?;
        Ok(body.len() as u64)
    }

    /// Stream the body straight onto the connection through a counting
    /// writer.
    pub fn send_unbuffered<W: Write + ?Sized>(&self, w: &mut W) -> Result<u64, WriteError> {
        let mut counter = WriteCounter::new(w);
        if let Some(err) = &self.error {
            tracing::warn!(code = self.code, error = %err, "sending error response");
            counter.write_all(err.to_string().as_bytes())?;
            counter.write_all(b"\n")?;
            return Ok(counter.count);
        }
        match self.request.output_format {
            heron_query::request::OutputFormat::WrappedJson => {
                self.write_wrapped_json(&mut counter)?
            }
            heron_query::request::OutputFormat::Json => self.write_json(&mut counter)?,
        }
        counter.write_all(b"\n")?;
        Ok(counter.count)
    }

    /// Render the body into a buffer (fixed-16 framing and tests).
    pub fn buffer(&self) -> Result<Vec<u8>, WriteError> {
        let mut buf = Vec::new();
        if let Some(err) = &self.error {
            tracing::warn!(code = self.code, error = %err, "sending error response");
            buf.extend_from_slice(err.to_string().as_bytes());
            return Ok(buf);
        }
        match self.request.output_format {
            heron_query::request::OutputFormat::WrappedJson => {
                self.write_wrapped_json(&mut buf)?
            }
            heron_query::request::OutputFormat::Json => self.write_json(&mut buf)?,
        }
        Ok(buf)
    }

    /// Plain envelope: a top-level array with an optional leading
    /// header row.
    fn write_json<W: Write>(&self, w: &mut W) -> io::Result<()> {
        w.write_all(b"[")?;

        if self.send_columns_header() {
            self.write_columns_header(w)?;
            if self.has_data_rows() {
                w.write_all(b",")?;
            }
        }

        self.write_data_rows(w)?;
        w.write_all(b"]")
    }

    /// Wrapped envelope:
    /// `{"data":[…],"failed":{…},"columns":[…]?,"rows_scanned":N,"total_count":N}`
    fn write_wrapped_json<W: Write>(&self, w: &mut W) -> io::Result<()> {
        w.write_all(b"{\"data\":\n[")?;
        self.write_data_rows(w)?;
        w.write_all(b"]\n,\"failed\": {")?;
        {
            let state = self.read_state();
            for (i, (peer_id, message)) in state.failed.iter().enumerate() {
                if i > 0 {
                    w.write_all(b",")?;
                }
                write_json_string(w, peer_id)?;
                w.write_all(b":")?;
                write_json_string(w, message.trim())?;
            }
        }
        w.write_all(b"}")?;

        if self.send_columns_header() {
            w.write_all(b"\n,\"columns\":")?;
            self.write_columns_header(w)?;
        }

        write!(w, "\n,\"rows_scanned\":{}", self.rows_scanned)?;
        write!(w, "\n,\"total_count\":{}}}", self.result_total)
    }

    fn has_data_rows(&self) -> bool {
        if let Some(raw) = &self.raw_results {
            if !raw.data.is_empty() {
                return true;
            }
        }
        !self.read_state().result.is_empty()
    }

    /// Stream the data part: raw row handles for the data path,
    /// materialized rows otherwise. Rows from `PeerLockMode::Full`
    /// stores take their peer's row lock once per row, not per column.
    fn write_data_rows<W: Write>(&self, w: &mut W) -> io::Result<()> {
        if let Some(raw) = &self.raw_results {
            let columns = &self.request.request_columns;
            let row_locked = raw
                .data
                .first()
                .map(|r| r.store.peer_lock_mode == PeerLockMode::Full)
                .unwrap_or(false);
            for (i, row) in raw.data.iter().enumerate() {
                if i > 0 {
                    w.write_all(b",\n")?;
                }
                if row_locked {
                    let _guard = row.store.row_lock.read();
                    row.write_json(w, columns)?;
                } else {
                    row.write_json(w, columns)?;
                }
            }
            return Ok(());
        }

        let state = self.read_state();
        for (i, row) in state.result.iter().enumerate() {
            if i > 0 {
                w.write_all(b",\n")?;
            }
            w.write_all(b"[")?;
            for (k, cell) in row.iter().enumerate() {
                if k > 0 {
                    w.write_all(b",")?;
                }
                serde_json::to_writer(&mut *w, cell)
                    .map_err(|e| io::Error::new(io::ErrorKind::InvalidData, e))?;
            }
            w.write_all(b"]")?;
        }
        Ok(())
    }

    /// Header emission rule: never with stats; otherwise when headers
    /// were requested explicitly or the request named no columns.
    pub fn send_columns_header(&self) -> bool {
        if !self.request.stats.is_empty() {
            return false;
        }
        self.request.columns_headers || self.request.columns.is_empty()
    }

    /// Header row: requested names where given, catalog names beyond
    /// that, `stats_1..N` for stats columns.
    fn write_columns_header<W: Write>(&self, w: &mut W) -> io::Result<()> {
        let request = &self.request;
        let mut cols: Vec<String> =
            Vec::with_capacity(request.request_columns.len() + request.stats.len());
        for (k, col) in request.request_columns.iter().enumerate() {
            match request.columns.get(k) {
                Some(name) => cols.push(name.clone()),
                None => cols.push(col.name.clone()),
            }
        }
        for i in 0..request.stats.len() {
            cols.push(format!("stats_{}", i + 1));
        }

        w.write_all(b"[")?;
        for (i, name) in cols.iter().enumerate() {
            if i > 0 {
                w.write_all(b",")?;
            }
            write_json_string(w, name)?;
        }
        w.write_all(b"]\n")
    }
}

fn write_json_string<W: Write>(w: &mut W, s: &str) -> io::Result<()> {
    serde_json::to_writer(w, s).map_err(|e| io::Error::new(io::ErrorKind::InvalidData, e))
}
