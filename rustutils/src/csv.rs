/// Non-allocating CSV tokenizer.
///
/// CSV is not a single well-defined format.  Here is what we're parsing:
///
///  - the input is UTF-8 / ASCII, no BOM allowed (or needed).
///  - there is one CSV record per line
///  - lines are terminated by ASCII newline 0x0A, exclusively
///  - the terminator is optional at EOF
///  - blank lines are treated as empty records
///  - lines have a hardcoded max length given by MAXLINE, below
///  - there is no header line
///  - fields are separated by ASCII comma 0x2C, exclusively
///  - the number of fields can vary between the lines
///  - fields can be empty
///  - fields can be enclosed in double-quotes ASCII 0x22 and double-quotes and commas are allowed
///    inside quoted fields
///  - newlines and EOF are not allowed inside double-quoted fields
///  - a double-quote is represented as two double-quotes in a double-quoted field
///
/// The tokenizer is opened on an io::Read and provides tokens.  A token is one of
/// CsvToken::Field, CsvToken::EOL, and CsvToken::EOF.  The CsvToken::Field is a triplet: start
/// index into byte buffer, one-past-end index into byte buffer, and index within that range of the
/// character following the first '=', if present and not the first character of the field,
/// otherwise CSV_EQ_SENTINEL.  The indices are valid until the next call to get() and can be
/// passed to buf_at(), buf_slice() and match_tag() to inspect the internal buffer.
///
/// Syntax errors are reported as a CsvSyntaxError inside the anyhow::Error, so that callers can
/// distinguish them from I/O errors with downcast_ref() and recover with scan_eol().
///
/// This is much more efficient than the serde-derived CSV parser, since the best we could do with
/// that - given the flexibility of the input format - was to parse the record as a vector of string
/// fields.  The allocation volume was tremendous.
use anyhow::Result;
use std::io;
use thiserror::Error;

pub enum CsvToken {
    Field(usize, usize, usize),
    EOL,
    EOF,
}

pub const CSV_EQ_SENTINEL: usize = usize::MAX;

#[derive(Error, Debug, Clone, Copy, PartialEq, Eq)]
#[error("CSV syntax error: {0}")]
pub struct CsvSyntaxError(pub &'static str);

const BUFSIZ: usize = 65536;
const MAXLINE: usize = 1024;

pub struct CsvTokenizer<'a> {
    ix: usize,
    lim: usize,
    start_of_line: bool,
    reader: &'a mut dyn io::Read,
    buf: [u8; BUFSIZ],
    #[cfg(test)]
    fail_refill: bool,
}

impl<'a> CsvTokenizer<'a> {
    pub fn new(reader: &'a mut dyn io::Read) -> Box<CsvTokenizer<'a>> {
        Box::new(CsvTokenizer {
            ix: 0,
            lim: 0,
            start_of_line: true,
            reader,
            buf: [0u8; BUFSIZ],
            #[cfg(test)]
            fail_refill: false,
        })
    }

    // Borrow the bytes start..lim of the buffer.  start and lim must have been returned with a
    // CsvToken::Field from get() (or lie within such a range).  Valid until the next call to get().
    pub fn buf_slice(&self, start: usize, lim: usize) -> &[u8] {
        &self.buf[start..lim]
    }

    // Get the byte in the buffer at the given locations, this is valid exclusively for locations
    // start..lim returned by a CsvToken::Field until the next call to get().
    pub fn buf_at(&self, loc: usize) -> u8 {
        self.buf[loc]
    }

    // Get the next token, or an error for syntax errors or I/O errors.
    pub fn get(&mut self) -> Result<CsvToken> {
        self.maybe_refill()?;

        // The following logic assumes \n is a sentinel at self.buf[self.lim].

        if self.buf[self.ix] == b'\n' {
            if self.ix == self.lim {
                return Ok(CsvToken::EOF);
            }
            self.ix += 1;
            self.start_of_line = true;
            return Ok(CsvToken::EOL);
        }

        if !self.start_of_line {
            assert!(self.buf[self.ix] == b',');
            self.ix += 1;
        }

        // Parse a field, terminated by EOF, EOL, or comma.
        let mut eqloc = CSV_EQ_SENTINEL;
        self.start_of_line = false;
        match self.buf[self.ix] {
            b'\n' | b',' => {
                // Empty field at EOL or EOF or comma
                Ok(CsvToken::Field(self.ix, self.ix, eqloc))
            }
            b'"' => {
                // This is a little hairy because every doubled quote has to be collapsed into a
                // single one.  We do this in the buffer.
                self.ix += 1;
                let startix = self.ix;
                let mut destix = startix;
                loop {
                    match self.buf[self.ix] {
                        b'\n' => {
                            return Err(CsvSyntaxError("Unexpected end of line or end of file").into());
                        }
                        b'=' => {
                            if eqloc == CSV_EQ_SENTINEL && destix > startix {
                                eqloc = destix + 1
                            }
                        }
                        b'"' => {
                            self.ix += 1;
                            if self.buf[self.ix] != b'"' {
                                // We're done.  We've already consumed the quote.  Check that the
                                // syntax is sane.
                                if self.buf[self.ix] != b',' && self.buf[self.ix] != b'\n' {
                                    return Err(CsvSyntaxError(
                                        "Expected comma or newline after quoted field",
                                    )
                                    .into());
                                }
                                return Ok(CsvToken::Field(startix, destix, eqloc));
                            }
                        }
                        _ => {}
                    }
                    self.buf[destix] = self.buf[self.ix];
                    destix += 1;
                    self.ix += 1;
                }
            }
            _ => {
                let startix = self.ix;
                loop {
                    match self.buf[self.ix] {
                        b'\n' | b',' => {
                            return Ok(CsvToken::Field(startix, self.ix, eqloc));
                        }
                        b'=' => {
                            if eqloc == CSV_EQ_SENTINEL && self.ix > startix {
                                eqloc = self.ix + 1
                            }
                        }
                        b'"' => {
                            return Err(CsvSyntaxError("Unexpected '\"'").into());
                        }
                        _ => {}
                    }
                    self.ix += 1;
                }
            }
        }
    }

    // Given start and non-sentinel eqloc values returned with a CsvToken::Field, and a string
    // <tag>, check if the buffer has the string <tag>= from location start.
    pub fn match_tag(&self, tag: &[u8], start: usize, eqloc: usize) -> bool {
        if start + tag.len() + 1 != eqloc {
            return false;
        }
        if self.buf[eqloc - 1] != b'=' {
            return false;
        }
        &self.buf[start..start + tag.len()] == tag
    }

    // Skip to the start of the next line (or EOF).  This is used for error recovery: after a
    // syntax error or a bad value the rest of the record is uninteresting.
    pub fn scan_eol(&mut self) {
        while self.buf[self.ix] != b'\n' {
            self.ix += 1;
        }
        if self.ix != self.lim {
            self.ix += 1;
        }
        self.start_of_line = true;
    }

    fn maybe_refill(&mut self) -> Result<()> {
        while self.lim - self.ix < MAXLINE {
            if self.ix != 0 {
                let n = self.lim - self.ix;
                self.buf.copy_within(self.ix..self.lim + 1, 0);
                self.ix = 0;
                self.lim = n;
            }
            #[cfg(test)]
            if self.fail_refill {
                return Err(io::Error::new(io::ErrorKind::Unsupported, "Test failure").into());
            }
            let nread = match self.reader.read(&mut self.buf[self.lim..BUFSIZ - 1]) {
                Ok(n) => n,
                Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
                Err(e) => return Err(e.into()),
            };
            self.lim += nread;
            self.buf[self.lim] = b'\n';
            if nread == 0 {
                break;
            }
        }
        Ok(())
    }

    #[cfg(test)]
    fn set_fail_refill(&mut self) {
        self.fail_refill = true;
    }
}

#[cfg(test)]
fn expect_field(tokenizer: &mut CsvTokenizer, expected: &str, eqoffs: Option<usize>) {
    if let CsvToken::Field(a, b, c) = tokenizer.get().unwrap() {
        assert!(tokenizer.buf_slice(a, b) == expected.as_bytes());
        match eqoffs {
            Some(offs) => assert!(c == a + offs),
            None => assert!(c == CSV_EQ_SENTINEL),
        }
    } else {
        assert!(false);
    }
}

#[cfg(test)]
fn is_syntax_error(r: Result<CsvToken>) -> bool {
    match r {
        Err(e) => e.downcast_ref::<CsvSyntaxError>().is_some(),
        Ok(_) => false,
    }
}

// This tests:
//  - empty fields, also at EOL (but not at EOF)
//  - quoted fields, also with commas and quotes in them
//  - unterminated last line
//  - blank line / empty record
//  - a leading '=' does not set eqloc

#[test]
fn test_csv_tokenizer1() {
    let text = r#"a,b=1,cc=2,,e,"f=1,2,3","g,""y"",z",=x

A,B"#;
    let mut bs = text.as_bytes();
    let mut tokenizer = CsvTokenizer::new(&mut bs);
    expect_field(&mut tokenizer, "a", None);
    expect_field(&mut tokenizer, "b=1", Some(2));
    expect_field(&mut tokenizer, "cc=2", Some(3));
    expect_field(&mut tokenizer, "", None);
    expect_field(&mut tokenizer, "e", None);
    expect_field(&mut tokenizer, "f=1,2,3", Some(2));
    expect_field(&mut tokenizer, "g,\"y\",z", None);
    expect_field(&mut tokenizer, "=x", None);
    assert!(matches!(tokenizer.get().unwrap(), CsvToken::EOL));
    assert!(matches!(tokenizer.get().unwrap(), CsvToken::EOL));
    expect_field(&mut tokenizer, "A", None);
    expect_field(&mut tokenizer, "B", None);
    assert!(matches!(tokenizer.get().unwrap(), CsvToken::EOF));
}

// This tests:
//  - empty field at EOF

#[test]
fn test_csv_tokenizer2() {
    let text = r#"a,"#;
    let mut bs = text.as_bytes();
    let mut tokenizer = CsvTokenizer::new(&mut bs);
    expect_field(&mut tokenizer, "a", None);
    expect_field(&mut tokenizer, "", None);
    assert!(matches!(tokenizer.get().unwrap(), CsvToken::EOF));
}

// This tests:
//  - syntax error: eol in quoted string
//  - recovery with scan_eol

#[test]
fn test_csv_tokenizer3() {
    let text = r#"a,"hi
ho"#;
    let mut bs = text.as_bytes();
    let mut tokenizer = CsvTokenizer::new(&mut bs);
    expect_field(&mut tokenizer, "a", None);
    assert!(is_syntax_error(tokenizer.get()));
    tokenizer.scan_eol();
    expect_field(&mut tokenizer, "ho", None);
    assert!(matches!(tokenizer.get().unwrap(), CsvToken::EOF));
}

// This tests:
//  - syntax error: eof in quoted string

#[test]
fn test_csv_tokenizer4() {
    let text = r#"a,"hi"#;
    let mut bs = text.as_bytes();
    let mut tokenizer = CsvTokenizer::new(&mut bs);
    expect_field(&mut tokenizer, "a", None);
    assert!(is_syntax_error(tokenizer.get()));
}

// This tests:
//  - syntax error: junk following quoted string

#[test]
fn test_csv_tokenizer5() {
    let text = r#"a,"hi"x,y"#;
    let mut bs = text.as_bytes();
    let mut tokenizer = CsvTokenizer::new(&mut bs);
    expect_field(&mut tokenizer, "a", None);
    assert!(is_syntax_error(tokenizer.get()));
}

// This tests:
//  - syntax error: quote in unquoted string

#[test]
fn test_csv_tokenizer6() {
    let text = r#"a,hi"x,y"#;
    let mut bs = text.as_bytes();
    let mut tokenizer = CsvTokenizer::new(&mut bs);
    expect_field(&mut tokenizer, "a", None);
    assert!(is_syntax_error(tokenizer.get()));
}

// This tests:
//  - refill logic
//
// Basically we're creating an input s.t. the characters for a token overlap the buffer boundary.
// Parts of the token are read on the initial fill, then the rest on the second fill.  The file
// contains single-token lines, each line is the 26-character string a...z followed by a newline.
// The test then just checks that every token looks right.

#[test]
fn test_csv_tokenizer7() {
    // Token+newline must straddle the buffer boundary in some interesting way
    assert!(BUFSIZ % 27 != 0 && BUFSIZ % 27 != 1 && BUFSIZ % 27 != 26);
    let mut text = "".to_string();
    let count = BUFSIZ * 3 / 27;
    for _i in 0..count {
        text += "abcdefghijklmnopqrstuvwxyz\n";
    }
    let mut bs = text.as_bytes();
    let mut tokenizer = CsvTokenizer::new(&mut bs);
    let mut state = 0;
    let mut found = 0;
    loop {
        match tokenizer.get().unwrap() {
            CsvToken::Field(a, b, c) => {
                assert!(state == 0);
                assert!(tokenizer.buf_slice(a, b) == b"abcdefghijklmnopqrstuvwxyz");
                assert!(c == CSV_EQ_SENTINEL);
                state = 1;
                found += 1;
            }
            CsvToken::EOL => {
                assert!(state == 1);
                state = 0;
            }
            CsvToken::EOF => {
                assert!(state == 0);
                break;
            }
        }
    }
    assert!(found == count);
}

// This tests:
//  - i/o error on refill, which is not a syntax error

#[test]
fn test_csv_tokenizer8() {
    // This is the same input as test_csv_tokenizer7() for a reason, see below.
    let mut text = "".to_string();
    let count = BUFSIZ * 3 / 27;
    for _i in 0..count {
        text += "abcdefghijklmnopqrstuvwxyz\n";
    }
    let mut bs = text.as_bytes();
    let mut tokenizer = CsvTokenizer::new(&mut bs);
    tokenizer.get().unwrap(); // Fill once
    tokenizer.set_fail_refill();
    loop {
        match tokenizer.get() {
            Ok(CsvToken::EOF) => {
                assert!(false);
            }
            Ok(_) => {}
            Err(e) => {
                // This can only be an I/O error because test_csv_tokenizer7() would otherwise have
                // encountered it, since it uses the same input.
                assert!(e.downcast_ref::<CsvSyntaxError>().is_none());
                assert!(e.downcast_ref::<io::Error>().is_some());
                break;
            }
        }
    }
}

// This tests:
//  - match_tag

#[test]
fn test_csv_match_tag() {
    let text = "cpu%=12,cpukib=5,cpu,x=";
    let mut bs = text.as_bytes();
    let mut tokenizer = CsvTokenizer::new(&mut bs);
    if let CsvToken::Field(a, _, c) = tokenizer.get().unwrap() {
        assert!(tokenizer.match_tag(b"cpu%", a, c));
        assert!(!tokenizer.match_tag(b"cpu", a, c));
        assert!(!tokenizer.match_tag(b"cpukib", a, c));
    } else {
        assert!(false);
    }
    if let CsvToken::Field(a, b, c) = tokenizer.get().unwrap() {
        assert!(tokenizer.match_tag(b"cpukib", a, c));
        assert!(tokenizer.buf_slice(c, b) == b"5");
    } else {
        assert!(false);
    }
    expect_field(&mut tokenizer, "cpu", None);
    expect_field(&mut tokenizer, "x=", Some(2));
}

// A reader that hands out data in tiny pieces, to exercise partial reads.

#[cfg(test)]
struct Dribble<'a> {
    data: &'a [u8],
}

#[cfg(test)]
impl<'a> io::Read for Dribble<'a> {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        let n = std::cmp::min(std::cmp::min(7, buf.len()), self.data.len());
        buf[..n].copy_from_slice(&self.data[..n]);
        self.data = &self.data[n..];
        Ok(n)
    }
}

// This tests:
//  - fields survive short reads from the underlying reader, and the result is the same as for a
//    single large read

#[test]
fn test_csv_tokenizer_dribble() {
    let mut text = "".to_string();
    for i in 0..5000 {
        text += &format!("v=0.11.1,time=2024-01-0{}T00:00:00Z,\"cmd=a,\"\"b\"\"\"\n", i % 9 + 1);
    }
    let mut fields1 = vec![];
    let mut fields2 = vec![];
    {
        let mut bs = text.as_bytes();
        let mut tokenizer = CsvTokenizer::new(&mut bs);
        loop {
            match tokenizer.get().unwrap() {
                CsvToken::Field(a, b, _) => fields1.push(tokenizer.buf_slice(a, b).to_vec()),
                CsvToken::EOL => {}
                CsvToken::EOF => break,
            }
        }
    }
    {
        let mut rdr = Dribble {
            data: text.as_bytes(),
        };
        let mut tokenizer = CsvTokenizer::new(&mut rdr);
        loop {
            match tokenizer.get().unwrap() {
                CsvToken::Field(a, b, _) => fields2.push(tokenizer.buf_slice(a, b).to_vec()),
                CsvToken::EOL => {}
                CsvToken::EOF => break,
            }
        }
    }
    assert!(fields2.len() == 15000);
    assert!(fields2[2] == b"cmd=a,\"b\"");
    assert!(fields1 == fields2);
}
