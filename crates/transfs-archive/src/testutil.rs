use std::io::Write;
use std::path::Path;

/// Write a stored (uncompressed) test archive with the given members.
pub(crate) fn write_zip(path: &Path, entries: &[(&str, &[u8])]) {
    write_zip_with(path, entries, zip::CompressionMethod::Stored)
}

/// Write a deflated test archive with the given members.
pub(crate) fn write_zip_deflated(path: &Path, entries: &[(&str, &[u8])]) {
    write_zip_with(path, entries, zip::CompressionMethod::Deflated)
}

fn write_zip_with(path: &Path, entries: &[(&str, &[u8])], method: zip::CompressionMethod) {
    let file = std::fs::File::create(path).unwrap();
    let mut writer = zip::ZipWriter::new(file);
    let options = zip::write::SimpleFileOptions::default().compression_method(method);
    for (name, data) in entries {
        writer.start_file(*name, options).unwrap();
        writer.write_all(data).unwrap();
    }
    writer.finish().unwrap();
}
