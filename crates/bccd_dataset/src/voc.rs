//! Pascal VOC annotation XML parser.
//!
//! Parses the per-image annotation files shipped with the BCCD corpus into
//! [`VocAnnotation`] records. Required structure is `<size>` (width/height)
//! and, per `<object>`, a `<name>` and a `<bndbox>` with all four corner
//! coordinates; `<difficult>` is optional. A missing required element is a
//! hard error that aborts the run.

use quick_xml::events::Event;
use quick_xml::Reader;
use std::fs;
use std::io::BufRead;
use std::path::Path;

use crate::types::{DatasetError, DatasetResult, PixelBox, VocAnnotation, VocObject};

pub fn parse_annotation_file(path: &Path) -> DatasetResult<VocAnnotation> {
    let raw = fs::read_to_string(path).map_err(|e| DatasetError::Io {
        path: path.to_path_buf(),
        source: e,
    })?;
    parse_annotation(&raw, path)
}

pub fn parse_annotation_str(xml: &str) -> DatasetResult<VocAnnotation> {
    parse_annotation(xml, Path::new("<in-memory>"))
}

fn parse_annotation(xml: &str, path: &Path) -> DatasetResult<VocAnnotation> {
    let mut reader = Reader::from_reader(xml.as_bytes());
    reader.config_mut().trim_text(true);
    let mut buf = Vec::new();

    let mut size: Option<(u32, u32)> = None;
    let mut objects = Vec::new();

    loop {
        match reader.read_event_into(&mut buf) {
            Ok(Event::Start(ref e)) => match e.name().as_ref() {
                b"annotation" => {}
                b"size" => {
                    size = Some(parse_size(&mut reader, path)?);
                }
                b"object" => {
                    objects.push(parse_object(&mut reader, path)?);
                }
                _ => {
                    let end = e.to_end().into_owned();
                    let mut skip = Vec::new();
                    reader
                        .read_to_end_into(end.name(), &mut skip)
                        .map_err(|e| xml_error(path, e))?;
                }
            },
            Ok(Event::Eof) => break,
            Ok(_) => {}
            Err(e) => return Err(xml_error(path, e)),
        }
        buf.clear();
    }

    let (width, height) = size.ok_or(DatasetError::MissingElement {
        element: "size",
        path: path.to_path_buf(),
    })?;
    Ok(VocAnnotation {
        width,
        height,
        objects,
    })
}

fn parse_size<R: BufRead>(reader: &mut Reader<R>, path: &Path) -> DatasetResult<(u32, u32)> {
    let mut buf = Vec::new();
    let mut width: Option<u32> = None;
    let mut height: Option<u32> = None;

    loop {
        match reader.read_event_into(&mut buf) {
            Ok(Event::Start(ref e)) => match e.name().as_ref() {
                b"width" => width = Some(read_number(reader, "width", path)?),
                b"height" => height = Some(read_number(reader, "height", path)?),
                _ => {}
            },
            Ok(Event::End(ref e)) if e.name().as_ref() == b"size" => break,
            Ok(Event::Eof) => {
                return Err(DatasetError::Xml {
                    path: path.to_path_buf(),
                    msg: "unexpected EOF inside <size>".into(),
                })
            }
            Ok(_) => {}
            Err(e) => return Err(xml_error(path, e)),
        }
        buf.clear();
    }

    let width = width.ok_or(DatasetError::MissingElement {
        element: "width",
        path: path.to_path_buf(),
    })?;
    let height = height.ok_or(DatasetError::MissingElement {
        element: "height",
        path: path.to_path_buf(),
    })?;
    Ok((width, height))
}

fn parse_object<R: BufRead>(reader: &mut Reader<R>, path: &Path) -> DatasetResult<VocObject> {
    let mut buf = Vec::new();
    let mut name: Option<String> = None;
    let mut difficult = false;
    let mut bbox: Option<PixelBox> = None;

    loop {
        match reader.read_event_into(&mut buf) {
            Ok(Event::Start(ref e)) => match e.name().as_ref() {
                b"name" => name = Some(read_text(reader, "name", path)?),
                b"difficult" => {
                    let raw = read_text(reader, "difficult", path)?;
                    let flag: i64 = raw.parse().map_err(|_| DatasetError::InvalidValue {
                        element: "difficult",
                        path: path.to_path_buf(),
                        msg: format!("expected an integer, got {raw:?}"),
                    })?;
                    difficult = flag == 1;
                }
                b"bndbox" => bbox = Some(parse_bndbox(reader, path)?),
                _ => {
                    let end = e.to_end().into_owned();
                    let mut skip = Vec::new();
                    reader
                        .read_to_end_into(end.name(), &mut skip)
                        .map_err(|e| xml_error(path, e))?;
                }
            },
            Ok(Event::End(ref e)) if e.name().as_ref() == b"object" => break,
            Ok(Event::Eof) => {
                return Err(DatasetError::Xml {
                    path: path.to_path_buf(),
                    msg: "unexpected EOF inside <object>".into(),
                })
            }
            Ok(_) => {}
            Err(e) => return Err(xml_error(path, e)),
        }
        buf.clear();
    }

    let name = name.ok_or(DatasetError::MissingElement {
        element: "name",
        path: path.to_path_buf(),
    })?;
    let bbox = bbox.ok_or(DatasetError::MissingElement {
        element: "bndbox",
        path: path.to_path_buf(),
    })?;
    Ok(VocObject {
        name,
        difficult,
        bbox,
    })
}

fn parse_bndbox<R: BufRead>(reader: &mut Reader<R>, path: &Path) -> DatasetResult<PixelBox> {
    let mut buf = Vec::new();
    let mut xmin: Option<f64> = None;
    let mut xmax: Option<f64> = None;
    let mut ymin: Option<f64> = None;
    let mut ymax: Option<f64> = None;

    loop {
        match reader.read_event_into(&mut buf) {
            Ok(Event::Start(ref e)) => match e.name().as_ref() {
                b"xmin" => xmin = Some(read_number(reader, "xmin", path)?),
                b"xmax" => xmax = Some(read_number(reader, "xmax", path)?),
                b"ymin" => ymin = Some(read_number(reader, "ymin", path)?),
                b"ymax" => ymax = Some(read_number(reader, "ymax", path)?),
                _ => {}
            },
            Ok(Event::End(ref e)) if e.name().as_ref() == b"bndbox" => break,
            Ok(Event::Eof) => {
                return Err(DatasetError::Xml {
                    path: path.to_path_buf(),
                    msg: "unexpected EOF inside <bndbox>".into(),
                })
            }
            Ok(_) => {}
            Err(e) => return Err(xml_error(path, e)),
        }
        buf.clear();
    }

    let require = |v: Option<f64>, element: &'static str| {
        v.ok_or(DatasetError::MissingElement {
            element,
            path: path.to_path_buf(),
        })
    };
    Ok(PixelBox {
        xmin: require(xmin, "xmin")?,
        xmax: require(xmax, "xmax")?,
        ymin: require(ymin, "ymin")?,
        ymax: require(ymax, "ymax")?,
    })
}

/// Collect text content until the enclosing element closes.
fn read_text<R: BufRead>(
    reader: &mut Reader<R>,
    element: &'static str,
    path: &Path,
) -> DatasetResult<String> {
    let mut buf = Vec::new();
    let mut text = String::new();
    loop {
        match reader.read_event_into(&mut buf) {
            Ok(Event::Text(ref t)) => {
                text.push_str(&t.unescape().map_err(|e| xml_error(path, e))?);
            }
            Ok(Event::End(_)) => break,
            Ok(Event::Eof) => {
                return Err(DatasetError::Xml {
                    path: path.to_path_buf(),
                    msg: format!("unexpected EOF inside <{element}>"),
                })
            }
            Ok(_) => {}
            Err(e) => return Err(xml_error(path, e)),
        }
        buf.clear();
    }
    Ok(text.trim().to_string())
}

fn read_number<R: BufRead, T: std::str::FromStr>(
    reader: &mut Reader<R>,
    element: &'static str,
    path: &Path,
) -> DatasetResult<T> {
    let raw = read_text(reader, element, path)?;
    raw.parse().map_err(|_| DatasetError::InvalidValue {
        element,
        path: path.to_path_buf(),
        msg: format!("expected a number, got {raw:?}"),
    })
}

fn xml_error(path: &Path, e: quick_xml::Error) -> DatasetError {
    DatasetError::Xml {
        path: path.to_path_buf(),
        msg: e.to_string(),
    }
}
