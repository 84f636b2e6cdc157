//! HandlerSocket request encoding and response parsing.
//!
//! A request is one line of TAB separated tokens. Bytes below `0x10` inside a
//! value are escaped as `0x01` followed by the byte shifted by `0x40`; a lone
//! `0x00` token is NULL. Responses start with an error code and a column count.

use crate::store::{Error, IndexId, IndexSpec, Op, Row};

pub(crate) const TAB: u8 = b'\t';
pub(crate) const EOL: u8 = b'\n';

const NULL: u8 = 0x00;
const ESCAPE_PREFIX: u8 = 0x01;
const ESCAPE_SHIFT: u8 = 0x40;
const ESCAPE_MAX: u8 = 0x0f;

const OPEN_INDEX: &[u8] = b"P";
const INSERT: &[u8] = b"+";
const MODIFY_UPDATE: &[u8] = b"U";
const MODIFY_DELETE: &[u8] = b"D";

/// Error code the server attaches to a rejected insert on a taken key.
const DUPLICATE_KEY: &str = "121";

pub(crate) fn escape_into(buf: &mut Vec<u8>, value: &[u8]) {
    for &byte in value {
        if byte <= ESCAPE_MAX {
            buf.push(ESCAPE_PREFIX);
            buf.push(byte + ESCAPE_SHIFT);
        } else {
            buf.push(byte);
        }
    }
}

pub(crate) fn unescape(token: &[u8]) -> Result<Option<Vec<u8>>, Error> {
    if token == [NULL] {
        return Ok(None);
    }

    let mut value = Vec::with_capacity(token.len());
    let mut bytes = token.iter().copied();
    while let Some(byte) = bytes.next() {
        if byte != ESCAPE_PREFIX {
            value.push(byte);
            continue;
        }

        match bytes.next() {
            Some(shifted) if (ESCAPE_SHIFT..=ESCAPE_SHIFT + ESCAPE_MAX).contains(&shifted) => {
                value.push(shifted - ESCAPE_SHIFT);
            }
            Some(other) => {
                return Err(Error::Protocol(format!(
                    "invalid escape sequence 0x01 0x{other:02x}"
                )));
            }
            None => return Err(Error::Protocol("dangling escape prefix".to_string())),
        }
    }

    Ok(Some(value))
}

#[derive(Debug, Default)]
struct RequestLine {
    buf: Vec<u8>,
}

impl RequestLine {
    fn token(&mut self, raw: &[u8]) -> &mut Self {
        if !self.buf.is_empty() {
            self.buf.push(TAB);
        }
        self.buf.extend_from_slice(raw);
        self
    }

    fn number(&mut self, n: impl ToString) -> &mut Self {
        self.token(n.to_string().as_bytes())
    }

    fn value(&mut self, value: &[u8]) -> &mut Self {
        if !self.buf.is_empty() {
            self.buf.push(TAB);
        }
        escape_into(&mut self.buf, value);
        self
    }

    fn values(&mut self, values: &[&[u8]]) -> &mut Self {
        for value in values {
            self.value(value);
        }
        self
    }

    fn find(&mut self, id: IndexId, op: Op, keys: &[&[u8]], limit: u32, offset: u32) -> &mut Self {
        self.number(id)
            .token(op.as_str().as_bytes())
            .number(keys.len())
            .values(keys)
            .number(limit)
            .number(offset)
    }

    fn finish(&mut self) -> Vec<u8> {
        let mut line = std::mem::take(&mut self.buf);
        line.push(EOL);
        line
    }
}

pub(crate) fn open_index(id: IndexId, spec: &IndexSpec<'_>) -> Vec<u8> {
    RequestLine::default()
        .token(OPEN_INDEX)
        .number(id)
        .value(spec.db.as_bytes())
        .value(spec.table.as_bytes())
        .value(spec.index.as_bytes())
        .value(spec.fields.join(",").as_bytes())
        .finish()
}

pub(crate) fn find(id: IndexId, op: Op, keys: &[&[u8]], limit: u32, offset: u32) -> Vec<u8> {
    RequestLine::default()
        .find(id, op, keys, limit, offset)
        .finish()
}

pub(crate) fn insert(id: IndexId, values: &[&[u8]]) -> Vec<u8> {
    RequestLine::default()
        .number(id)
        .token(INSERT)
        .number(values.len())
        .values(values)
        .finish()
}

pub(crate) fn update(
    id: IndexId,
    op: Op,
    keys: &[&[u8]],
    values: &[&[u8]],
    limit: u32,
    offset: u32,
) -> Vec<u8> {
    RequestLine::default()
        .find(id, op, keys, limit, offset)
        .token(MODIFY_UPDATE)
        .values(values)
        .finish()
}

pub(crate) fn delete(id: IndexId, op: Op, keys: &[&[u8]], limit: u32, offset: u32) -> Vec<u8> {
    RequestLine::default()
        .find(id, op, keys, limit, offset)
        .token(MODIFY_DELETE)
        .finish()
}

/// A successful response line.
#[derive(Debug, PartialEq, Eq)]
pub(crate) struct Response {
    pub(crate) num_columns: usize,
    pub(crate) values: Vec<Option<Vec<u8>>>,
}

impl Response {
    pub(crate) fn into_rows(self) -> Result<Vec<Row>, Error> {
        if self.num_columns == 0 {
            return Ok(Vec::new());
        }
        if self.values.len() % self.num_columns != 0 {
            return Err(Error::Protocol(format!(
                "{} values do not fill rows of {} columns",
                self.values.len(),
                self.num_columns
            )));
        }

        let mut rows = Vec::with_capacity(self.values.len() / self.num_columns);
        let mut values = self.values.into_iter();
        loop {
            let row: Row = values.by_ref().take(self.num_columns).collect();
            if row.is_empty() {
                break;
            }
            rows.push(row);
        }
        Ok(rows)
    }

    /// Row count carried by a modify response; absent means nothing changed.
    pub(crate) fn affected_rows(&self) -> Result<u64, Error> {
        match self.values.first() {
            Some(Some(count)) => parse_number(count),
            _ => Ok(0),
        }
    }
}

/// Parses one response line, without its trailing newline.
pub(crate) fn parse_response(line: &[u8]) -> Result<Response, Error> {
    let mut tokens = line.split(|byte| *byte == TAB);

    let code: i32 = match tokens.next() {
        Some(token) if !token.is_empty() => parse_number(token)?,
        _ => return Err(Error::Protocol("empty response".to_string())),
    };
    let num_columns: usize = match tokens.next() {
        Some(token) => parse_number(token)?,
        None => return Err(Error::Protocol("response without column count".to_string())),
    };

    if code != 0 {
        let message = tokens
            .next()
            .map(|token| String::from_utf8_lossy(token).into_owned())
            .unwrap_or_default();
        if message == DUPLICATE_KEY {
            return Err(Error::DuplicateKey);
        }
        return Err(Error::Server { code, message });
    }

    let values = tokens.map(unescape).collect::<Result<Vec<_>, _>>()?;
    Ok(Response {
        num_columns,
        values,
    })
}

fn parse_number<T: std::str::FromStr>(token: &[u8]) -> Result<T, Error> {
    std::str::from_utf8(token)
        .ok()
        .and_then(|s| s.parse().ok())
        .ok_or_else(|| {
            Error::Protocol(format!(
                "expected a number, got `{}`",
                String::from_utf8_lossy(token)
            ))
        })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_escape_low_bytes() {
        let mut buf = Vec::new();
        escape_into(&mut buf, b"a\tb\nc\x00");
        assert_eq!(buf, b"a\x01\x49b\x01\x4ac\x01\x40");
        assert_eq!(unescape(&buf).unwrap(), Some(b"a\tb\nc\x00".to_vec()));
    }

    #[test]
    fn test_unescape_null_and_empty() {
        assert_eq!(unescape(&[0x00]).unwrap(), None);
        assert_eq!(unescape(b"").unwrap(), Some(Vec::new()));
    }

    #[test]
    fn test_unescape_rejects_bad_sequences() {
        assert!(matches!(unescape(b"ab\x01"), Err(Error::Protocol(_))));
        assert!(matches!(unescape(b"\x01\x7f"), Err(Error::Protocol(_))));
    }

    #[test]
    fn test_open_index_request() {
        let spec = IndexSpec {
            db: "session",
            table: "php_session",
            index: "PRIMARY",
            fields: &["id", "modified", "data"],
        };
        assert_eq!(
            open_index(IndexId::new(1), &spec),
            b"P\t1\tsession\tphp_session\tPRIMARY\tid,modified,data\n"
        );

        let gc = IndexSpec {
            index: "modified",
            fields: &[],
            ..spec
        };
        assert_eq!(
            open_index(IndexId::new(2), &gc),
            b"P\t2\tsession\tphp_session\tmodified\t\n"
        );
    }

    #[test]
    fn test_modify_requests() {
        let id = IndexId::new(1);
        assert_eq!(
            find(id, Op::Eq, &[b"abc".as_slice()], 1, 0),
            b"1\t=\t1\tabc\t1\t0\n"
        );
        assert_eq!(
            insert(id, &[b"abc".as_slice(), b"2024-01-01 00:00:00", b"x=1"]),
            b"1\t+\t3\tabc\t2024-01-01 00:00:00\tx=1\n"
        );
        assert_eq!(
            update(
                id,
                Op::Eq,
                &[b"abc".as_slice()],
                &[b"abc".as_slice(), b"t", b"\x02"],
                1,
                0
            ),
            b"1\t=\t1\tabc\t1\t0\tU\tabc\tt\t\x01\x42\n"
        );
        assert_eq!(
            delete(IndexId::new(2), Op::Lt, &[b"t".as_slice()], 1000, 0),
            b"2\t<\t1\tt\t1000\t0\tD\n"
        );
    }

    #[test]
    fn test_parse_find_response() {
        let response = parse_response(b"0\t3\tabc\t2024-01-01 00:00:00\tx\x01\x49y").unwrap();
        let rows = response.into_rows().unwrap();
        assert_eq!(rows.len(), 1);
        assert_eq!(rows[0][0].as_deref(), Some(&b"abc"[..]));
        assert_eq!(rows[0][2].as_deref(), Some(&b"x\ty"[..]));

        let empty = parse_response(b"0\t3").unwrap().into_rows().unwrap();
        assert!(empty.is_empty());

        let null = parse_response(b"0\t1\t\x00").unwrap().into_rows().unwrap();
        assert_eq!(null, vec![vec![None]]);
    }

    #[test]
    fn test_parse_modify_and_errors() {
        assert_eq!(parse_response(b"0\t1\t7").unwrap().affected_rows().unwrap(), 7);
        assert_eq!(parse_response(b"0\t1").unwrap().affected_rows().unwrap(), 0);

        assert!(matches!(
            parse_response(b"1\t1\t121"),
            Err(Error::DuplicateKey)
        ));
        match parse_response(b"2\t1\tstmtnum") {
            Err(Error::Server { code, message }) => {
                assert_eq!(code, 2);
                assert_eq!(message, "stmtnum");
            }
            other => panic!("unexpected {other:?}"),
        }
        assert!(matches!(parse_response(b""), Err(Error::Protocol(_))));
        assert!(matches!(
            parse_response(b"0\t2\ta").unwrap().into_rows(),
            Err(Error::Protocol(_))
        ));
    }
}
