use std::fmt::Display;
use std::fs::File;
use std::io::Write;
use std::path::Path;

use quick_xml::events::{BytesStart, Event};
use quick_xml::Reader;

use crate::jobs::Job;
use crate::models::error::{cancelled, corrupt_catalog, io_error};
use crate::models::{CatalogResult, DetectFile, License, Package, PackageVersion, Version};

/// Receives the records parsed out of one repository document.
pub trait RecordSink {
    fn package(&mut self, package: Package) -> CatalogResult<()>;

    /// `fragment` is the verbatim bytes of the `<version>` element; the
    /// catalog stores it unchanged and re-parses it on demand.
    fn package_version(&mut self, version: PackageVersion, fragment: &[u8]) -> CatalogResult<()>;

    fn license(&mut self, license: License) -> CatalogResult<()>;
}

const ZIP_MAGIC: [u8; 4] = [0x50, 0x4B, 0x03, 0x04];
const ARCHIVE_DOCUMENT: &str = "Rep.xml";

/// Ingests one downloaded artifact: a ZIP archive containing `Rep.xml`
/// (detected by the leading `PK\x03\x04` magic) or a raw XML document.
pub fn ingest_artifact(job: &Job, path: &Path, sink: &mut dyn RecordSink) -> CatalogResult<()> {
    if !job.should_proceed() {
        return Err(cancelled());
    }

    let bytes =
        std::fs::read(path).map_err(|e| io_error("reading the downloaded repository", e))?;

    let document = if bytes.len() >= 4 && bytes[..4] == ZIP_MAGIC {
        let sub = job.new_sub_job(0.1, "Extracting");
        let extracted = extract_archive_document(&bytes)?;
        sub.complete();
        extracted
    } else {
        bytes
    };

    let sub = job.new_sub_job(0.9, "Parsing XML");
    parse_document(&sub, &document, sink)?;
    sub.complete();
    job.set_progress(1.0);
    Ok(())
}

/// Unzips `Rep.xml` through a scratch directory scoped to this call.
fn extract_archive_document(bytes: &[u8]) -> CatalogResult<Vec<u8>> {
    let mut archive = zip::ZipArchive::new(std::io::Cursor::new(bytes))
        .map_err(|e| io_error("opening the repository archive", std::io::Error::other(e)))?;

    let mut entry = archive.by_name(ARCHIVE_DOCUMENT).map_err(|_| {
        io_error(
            "opening the repository archive",
            std::io::Error::other("Rep.xml is missing in a repository in ZIP format"),
        )
    })?;

    let dir = tempfile::tempdir().map_err(|e| io_error("creating a scratch directory", e))?;
    let extracted_path = dir.path().join(ARCHIVE_DOCUMENT);
    let mut extracted =
        File::create(&extracted_path).map_err(|e| io_error("extracting Rep.xml", e))?;
    std::io::copy(&mut entry, &mut extracted).map_err(|e| io_error("extracting Rep.xml", e))?;
    extracted.flush().map_err(|e| io_error("extracting Rep.xml", e))?;
    drop(extracted);

    std::fs::read(&extracted_path).map_err(|e| io_error("reading the extracted Rep.xml", e))
}

/// Streams a repository document into the sink. Cancellation is polled
/// between top-level elements.
pub fn parse_document(job: &Job, bytes: &[u8], sink: &mut dyn RecordSink) -> CatalogResult<()> {
    let mut reader = Reader::from_reader(bytes);
    reader.config_mut().trim_text(true);

    let mut saw_root = false;
    loop {
        if !job.should_proceed() {
            return Err(cancelled());
        }

        let element_start = reader.buffer_position() as usize;
        match reader.read_event() {
            Err(e) => return Err(parse_error(bytes, reader.error_position() as usize, e)),
            Ok(Event::Eof) => break,
            Ok(Event::Start(e)) => {
                if !saw_root {
                    saw_root = true;
                    continue;
                }
                match e.local_name().as_ref() {
                    b"license" => {
                        let license = parse_license(&mut reader, &e, bytes)?;
                        sink.license(license)?;
                    }
                    b"package" => {
                        let package = parse_package(&mut reader, &e, bytes)?;
                        sink.package(package)?;
                    }
                    b"version" => {
                        let name = e.name();
                        reader
                            .read_to_end(name)
                            .map_err(|err| parse_error(bytes, element_start, err))?;
                        let element_end = reader.buffer_position() as usize;
                        // Leading inter-element whitespace is consumed
                        // together with the start tag; the stored
                        // fragment begins at the tag itself.
                        let mut fragment_start = element_start;
                        while fragment_start < element_end
                            && bytes[fragment_start].is_ascii_whitespace()
                        {
                            fragment_start += 1;
                        }
                        let fragment = &bytes[fragment_start..element_end];
                        let (line, column) = line_col(bytes, fragment_start);
                        let version = parse_version_fragment_at(fragment, line, column)?;
                        sink.package_version(version, fragment)?;
                    }
                    _ => {
                        let name = e.name();
                        reader
                            .read_to_end(name)
                            .map_err(|err| parse_error(bytes, element_start, err))?;
                    }
                }
            }
            Ok(_) => {}
        }
    }

    Ok(())
}

/// Re-parses a stored `<version>` fragment into its model form.
pub fn parse_version_fragment(fragment: &[u8]) -> CatalogResult<PackageVersion> {
    parse_version_fragment_at(fragment, 1, 1)
}

/// Like [`parse_version_fragment`], reporting positions relative to
/// `(base_line, base_column)` in the enclosing document.
fn parse_version_fragment_at(
    fragment: &[u8],
    base_line: u64,
    base_column: u64,
) -> CatalogResult<PackageVersion> {
    let mut reader = Reader::from_reader(fragment);
    reader.config_mut().trim_text(true);

    let rebase = |error: crate::models::CatalogError| {
        let Some((line, column)) = error.position else {
            return error;
        };
        let (line, column) = if line == 1 {
            (base_line, base_column + column - 1)
        } else {
            (base_line + line - 1, column)
        };
        corrupt_catalog(line, column, error.message)
    };

    loop {
        match reader.read_event() {
            Err(e) => {
                return Err(rebase(parse_error(
                    fragment,
                    reader.error_position() as usize,
                    e,
                )))
            }
            Ok(Event::Eof) => {
                return Err(rebase(parse_error(
                    fragment,
                    fragment.len(),
                    "missing version element",
                )))
            }
            Ok(Event::Start(e)) if e.local_name().as_ref() == b"version" => {
                return parse_version_element(&mut reader, &e, fragment).map_err(rebase);
            }
            Ok(_) => {}
        }
    }
}

fn parse_version_element(
    reader: &mut Reader<&[u8]>,
    start: &BytesStart<'_>,
    bytes: &[u8],
) -> CatalogResult<PackageVersion> {
    let position = reader.buffer_position() as usize;
    let package = required_attribute(start, "package", bytes, position)?;
    let version_text = required_attribute(start, "name", bytes, position)?;
    let version = Version::parse(&version_text).ok_or_else(|| {
        let (line, column) = line_col(bytes, position);
        corrupt_catalog(line, column, format!("invalid version '{version_text}'"))
    })?;

    let mut pv = PackageVersion::new(package, version);

    loop {
        let element_start = reader.buffer_position() as usize;
        match reader.read_event() {
            Err(e) => return Err(parse_error(bytes, reader.error_position() as usize, e)),
            Ok(Event::Eof) => {
                return Err(parse_error(bytes, bytes.len(), "unclosed version element"))
            }
            Ok(Event::End(e)) if e.local_name().as_ref() == b"version" => break,
            Ok(Event::Start(e)) => match e.local_name().as_ref() {
                b"url" => pv.download_url = Some(element_text(reader, &e, bytes)?),
                b"msi-guid" => {
                    pv.msi_guid = Some(element_text(reader, &e, bytes)?.to_lowercase())
                }
                b"detect-file" => pv.detect_files.push(parse_detect_file(reader, &e, bytes)?),
                _ => {
                    // Installer metadata stays opaque to the catalog.
                    let name = e.name();
                    reader
                        .read_to_end(name)
                        .map_err(|err| parse_error(bytes, element_start, err))?;
                }
            },
            Ok(_) => {}
        }
    }

    Ok(pv)
}

fn parse_detect_file(
    reader: &mut Reader<&[u8]>,
    start: &BytesStart<'_>,
    bytes: &[u8],
) -> CatalogResult<DetectFile> {
    let mut path = String::new();
    let mut sha1 = None;

    loop {
        let element_start = reader.buffer_position() as usize;
        match reader.read_event() {
            Err(e) => return Err(parse_error(bytes, reader.error_position() as usize, e)),
            Ok(Event::Eof) => {
                return Err(parse_error(bytes, bytes.len(), "unclosed detect-file element"))
            }
            Ok(Event::End(e)) if e.local_name() == start.local_name() => break,
            Ok(Event::Start(e)) => match e.local_name().as_ref() {
                b"path" => path = element_text(reader, &e, bytes)?,
                b"sha1" => sha1 = Some(element_text(reader, &e, bytes)?.to_lowercase()),
                _ => {
                    let name = e.name();
                    reader
                        .read_to_end(name)
                        .map_err(|err| parse_error(bytes, element_start, err))?;
                }
            },
            Ok(_) => {}
        }
    }

    Ok(DetectFile { path, sha1 })
}

fn parse_license(
    reader: &mut Reader<&[u8]>,
    start: &BytesStart<'_>,
    bytes: &[u8],
) -> CatalogResult<License> {
    let position = reader.buffer_position() as usize;
    let name = required_attribute(start, "name", bytes, position)?;
    let mut license = License::new(name, String::new());

    loop {
        let element_start = reader.buffer_position() as usize;
        match reader.read_event() {
            Err(e) => return Err(parse_error(bytes, reader.error_position() as usize, e)),
            Ok(Event::Eof) => {
                return Err(parse_error(bytes, bytes.len(), "unclosed license element"))
            }
            Ok(Event::End(e)) if e.local_name().as_ref() == b"license" => break,
            Ok(Event::Start(e)) => match e.local_name().as_ref() {
                b"title" => license.title = element_text(reader, &e, bytes)?,
                b"description" => license.description = element_text(reader, &e, bytes)?,
                b"url" => license.url = element_text(reader, &e, bytes)?,
                _ => {
                    let name = e.name();
                    reader
                        .read_to_end(name)
                        .map_err(|err| parse_error(bytes, element_start, err))?;
                }
            },
            Ok(_) => {}
        }
    }

    Ok(license)
}

fn parse_package(
    reader: &mut Reader<&[u8]>,
    start: &BytesStart<'_>,
    bytes: &[u8],
) -> CatalogResult<Package> {
    let position = reader.buffer_position() as usize;
    let name = required_attribute(start, "name", bytes, position)?;
    let mut package = Package::new(name, String::new());

    loop {
        let element_start = reader.buffer_position() as usize;
        match reader.read_event() {
            Err(e) => return Err(parse_error(bytes, reader.error_position() as usize, e)),
            Ok(Event::Eof) => {
                return Err(parse_error(bytes, bytes.len(), "unclosed package element"))
            }
            Ok(Event::End(e)) if e.local_name().as_ref() == b"package" => break,
            Ok(Event::Empty(e)) if e.local_name().as_ref() == b"link" => {
                add_link(&mut package, &e, bytes, element_start)?;
            }
            Ok(Event::Start(e)) => match e.local_name().as_ref() {
                b"title" => package.title = element_text(reader, &e, bytes)?,
                b"url" => package.url = element_text(reader, &e, bytes)?,
                b"icon" => package.icon = element_text(reader, &e, bytes)?,
                b"description" => package.description = element_text(reader, &e, bytes)?,
                b"license" => package.license = element_text(reader, &e, bytes)?,
                b"category" => package.categories.push(element_text(reader, &e, bytes)?),
                b"link" => {
                    add_link(&mut package, &e, bytes, element_start)?;
                    let name = e.name();
                    reader
                        .read_to_end(name)
                        .map_err(|err| parse_error(bytes, element_start, err))?;
                }
                _ => {
                    let name = e.name();
                    reader
                        .read_to_end(name)
                        .map_err(|err| parse_error(bytes, element_start, err))?;
                }
            },
            Ok(_) => {}
        }
    }

    Ok(package)
}

fn add_link(
    package: &mut Package,
    element: &BytesStart<'_>,
    bytes: &[u8],
    position: usize,
) -> CatalogResult<()> {
    let rel = required_attribute(element, "rel", bytes, position)?;
    let href = required_attribute(element, "href", bytes, position)?;
    if !rel.is_empty() && !href.is_empty() {
        package.links.add(rel, href);
    }
    Ok(())
}

fn element_text(
    reader: &mut Reader<&[u8]>,
    element: &BytesStart<'_>,
    bytes: &[u8],
) -> CatalogResult<String> {
    let position = reader.buffer_position() as usize;
    let text = reader
        .read_text(element.name())
        .map_err(|e| parse_error(bytes, position, e))?;
    Ok(text.trim().to_string())
}

fn required_attribute(
    element: &BytesStart<'_>,
    name: &str,
    bytes: &[u8],
    position: usize,
) -> CatalogResult<String> {
    let attribute = element
        .try_get_attribute(name)
        .map_err(|e| parse_error(bytes, position, e))?
        .ok_or_else(|| {
            let (line, column) = line_col(bytes, position);
            corrupt_catalog(
                line,
                column,
                format!(
                    "missing attribute '{}' on '{}'",
                    name,
                    String::from_utf8_lossy(element.local_name().as_ref())
                ),
            )
        })?;
    let value = attribute
        .unescape_value()
        .map_err(|e| parse_error(bytes, position, e))?;
    Ok(value.into_owned())
}

fn parse_error(
    bytes: &[u8],
    offset: usize,
    error: impl Display,
) -> crate::models::CatalogError {
    let (line, column) = line_col(bytes, offset.min(bytes.len()));
    corrupt_catalog(line, column, error.to_string())
}

/// 1-based line and column of a byte offset.
fn line_col(bytes: &[u8], offset: usize) -> (u64, u64) {
    let mut line = 1u64;
    let mut line_start = 0usize;
    for (i, b) in bytes[..offset].iter().enumerate() {
        if *b == b'\n' {
            line += 1;
            line_start = i + 1;
        }
    }
    (line, (offset - line_start) as u64 + 1)
}
