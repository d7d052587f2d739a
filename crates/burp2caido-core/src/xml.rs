use std::fs::File;
use std::io::{BufRead, BufReader};
use std::iter::FusedIterator;
use std::path::Path;

use quick_xml::events::{BytesStart, Event};
use quick_xml::Reader;

use crate::{ImportError, Item, Payload, PayloadEncoding};

const ITEM_ELEMENT: &[u8] = b"item";

/// Streams [`Item`]s out of a Burp XML export in document order.
///
/// Only the `<item>` being decoded is held in memory. Field errors are yielded
/// for their own item and decoding resumes after its end tag; a
/// [`ImportError::MalformedInput`] ends the stream.
pub struct ItemReader<R: BufRead> {
    reader: Reader<R>,
    buf: Vec<u8>,
    depth: usize,
    items_read: usize,
    finished: bool,
}

impl ItemReader<BufReader<File>> {
    /// Opens an export on disk.
    ///
    /// # Errors
    /// Returns [`ImportError::Io`] when the file cannot be opened.
    pub fn from_path(path: &Path) -> Result<Self, ImportError> {
        let file = File::open(path).map_err(|err| {
            ImportError::Io(format!("failed to open {}: {err}", path.display()))
        })?;
        Ok(Self::new(BufReader::new(file)))
    }
}

impl<R: BufRead> ItemReader<R> {
    pub fn new(source: R) -> Self {
        Self {
            reader: Reader::from_reader(source),
            buf: Vec::new(),
            depth: 0,
            items_read: 0,
            finished: false,
        }
    }

    fn next_item(&mut self) -> Result<Option<Item>, ImportError> {
        loop {
            self.buf.clear();
            let step = match self.reader.read_event_into(&mut self.buf) {
                Ok(Event::Start(start)) if start.local_name().as_ref() == ITEM_ELEMENT => {
                    Step::Item
                }
                Ok(Event::Empty(start)) if start.local_name().as_ref() == ITEM_ELEMENT => {
                    Step::EmptyItem
                }
                Ok(Event::Start(_)) => Step::Open,
                Ok(Event::End(_)) => Step::Close,
                Ok(Event::Eof) => Step::Eof,
                Ok(_) => Step::Skip,
                Err(err) => return Err(malformed(&err, self.reader.error_position())),
            };

            match step {
                Step::Item => {
                    self.items_read += 1;
                    return self.read_item(self.items_read).map(Some);
                }
                Step::EmptyItem => {
                    self.items_read += 1;
                    return Ok(Some(Item::default()));
                }
                Step::Open => self.depth += 1,
                Step::Close => self.depth = self.depth.saturating_sub(1),
                Step::Eof if self.depth > 0 => {
                    return Err(ImportError::MalformedInput(format!(
                        "unexpected end of document with {} unclosed element(s)",
                        self.depth
                    )));
                }
                Step::Eof => return Ok(None),
                Step::Skip => {}
            }
        }
    }

    fn read_item(&mut self, index: usize) -> Result<Item, ImportError> {
        let mut item = Item::default();
        let mut field: Option<FieldCapture> = None;
        let mut nested = 0_usize;
        let mut first_invalid: Option<ImportError> = None;

        loop {
            self.buf.clear();
            let event = match self.reader.read_event_into(&mut self.buf) {
                Ok(event) => event,
                Err(err) => return Err(malformed(&err, self.reader.error_position())),
            };

            match event {
                Event::Start(start) => {
                    if field.is_some() {
                        nested += 1;
                    } else {
                        field = Some(FieldCapture::open(&start)?);
                    }
                }
                Event::Empty(start) => {
                    if field.is_none() {
                        let capture = FieldCapture::open(&start)?;
                        if let Err(err) = capture.assign(&mut item, index) {
                            first_invalid.get_or_insert(err);
                        }
                    }
                }
                Event::Text(text) => {
                    if let Some(capture) = field.as_mut().filter(|_| nested == 0) {
                        let unescaped = text.unescape().map_err(|err| {
                            malformed(&err, self.reader.error_position())
                        })?;
                        capture.text.push_str(&unescaped);
                    }
                }
                Event::CData(data) => {
                    if let Some(capture) = field.as_mut().filter(|_| nested == 0) {
                        let segment = std::str::from_utf8(&data).map_err(|err| {
                            ImportError::MalformedInput(format!(
                                "item {index}: CDATA is not valid UTF-8: {err}"
                            ))
                        })?;
                        capture.text.push_str(segment);
                    }
                }
                Event::End(_) => {
                    if nested > 0 {
                        nested -= 1;
                    } else if let Some(capture) = field.take() {
                        if let Err(err) = capture.assign(&mut item, index) {
                            first_invalid.get_or_insert(err);
                        }
                    } else {
                        return match first_invalid {
                            Some(err) => Err(err),
                            None => Ok(item),
                        };
                    }
                }
                Event::Eof => {
                    return Err(ImportError::MalformedInput(format!(
                        "unexpected end of document inside item {index}"
                    )));
                }
                _ => {}
            }
        }
    }
}

impl<R: BufRead> Iterator for ItemReader<R> {
    type Item = Result<crate::Item, ImportError>;

    fn next(&mut self) -> Option<Self::Item> {
        if self.finished {
            return None;
        }

        match self.next_item() {
            Ok(Some(item)) => Some(Ok(item)),
            Ok(None) => {
                self.finished = true;
                None
            }
            Err(err) => {
                if err.is_fatal() {
                    self.finished = true;
                }
                Some(Err(err))
            }
        }
    }
}

impl<R: BufRead> FusedIterator for ItemReader<R> {}

enum Step {
    Item,
    EmptyItem,
    Open,
    Close,
    Eof,
    Skip,
}

struct FieldCapture {
    name: String,
    encoding: PayloadEncoding,
    text: String,
}

impl FieldCapture {
    fn open(start: &BytesStart<'_>) -> Result<Self, ImportError> {
        let name = String::from_utf8_lossy(start.local_name().as_ref()).into_owned();
        let mut encoding = PayloadEncoding::Base64;

        for attribute in start.attributes() {
            let attribute = attribute.map_err(|err| {
                ImportError::MalformedInput(format!("invalid attribute on <{name}>: {err}"))
            })?;
            if attribute.key.local_name().as_ref() == b"base64" {
                let value = attribute.unescape_value().map_err(|err| {
                    ImportError::MalformedInput(format!("invalid base64 attribute: {err}"))
                })?;
                if value.trim() == "false" {
                    encoding = PayloadEncoding::Literal;
                }
            }
        }

        Ok(Self {
            name,
            encoding,
            text: String::new(),
        })
    }

    fn assign(self, item: &mut Item, index: usize) -> Result<(), ImportError> {
        match self.name.as_str() {
            "time" => item.time = self.text,
            "url" => item.url = self.text,
            "host" => item.host = self.text,
            "port" => item.port = parse_integer(index, "port", &self.text)?,
            "protocol" => item.protocol = self.text,
            "method" => item.method = self.text,
            "path" => item.path = self.text,
            "extension" => item.extension = self.text,
            "request" => {
                item.request = Payload {
                    text: self.text,
                    encoding: self.encoding,
                };
            }
            "status" => item.status = parse_integer(index, "status", &self.text)?,
            "responselength" => {
                item.response_length = parse_integer(index, "responselength", &self.text)?;
            }
            "mimetype" => item.mime_type = self.text,
            "response" => {
                item.response = Payload {
                    text: self.text,
                    encoding: self.encoding,
                };
            }
            "comment" => item.comment = self.text,
            other => tracing::debug!(item = index, element = other, "skipping unknown item field"),
        }
        Ok(())
    }
}

// Empty text decodes to zero, as Burp leaves `<status>` empty for requests
// that never got a response.
fn parse_integer(index: usize, field: &'static str, raw: &str) -> Result<i64, ImportError> {
    let trimmed = raw.trim();
    if trimmed.is_empty() {
        return Ok(0);
    }
    trimmed
        .parse()
        .map_err(|_| ImportError::InvalidField {
            index,
            field,
            value: raw.to_string(),
        })
}

fn malformed(err: &impl std::fmt::Display, position: impl std::fmt::Display) -> ImportError {
    ImportError::MalformedInput(format!("{err} (near byte {position})"))
}
