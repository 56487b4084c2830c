//! Shared helpers for reading back finalized atlas archives in tests.

use serde_json::Value;
use std::io::Read;
use std::path::Path;

pub struct OpenedArchive {
    pub manifest: Value,
    pub summary: Value,
    pub members: Vec<String>,
    archive: zip::ZipArchive<std::fs::File>,
}

pub fn open_archive(path: &Path) -> OpenedArchive {
    let file = std::fs::File::open(path).expect("archive file exists");
    let mut archive = zip::ZipArchive::new(file).expect("archive is a readable zip");
    let members: Vec<String> = (0..archive.len())
        .map(|i| archive.by_index(i).unwrap().name().to_string())
        .collect();
    let manifest = read_json(&mut archive, "manifest.json");
    let summary = read_json(&mut archive, "summary.json");
    OpenedArchive { manifest, summary, members, archive }
}

impl OpenedArchive {
    /// All records of one dataset across its parts, in part order.
    pub fn dataset_records(&mut self, dataset: &str) -> Vec<Value> {
        let mut part_names: Vec<String> = self
            .members
            .iter()
            .filter(|name| {
                name.starts_with(&format!("{dataset}/part-")) && name.ends_with(".jsonl.zst")
            })
            .cloned()
            .collect();
        part_names.sort();

        let mut records = Vec::new();
        for name in part_names {
            let mut member = self.archive.by_name(&name).unwrap();
            let mut compressed = Vec::new();
            member.read_to_end(&mut compressed).unwrap();
            let decoded = zstd::stream::decode_all(compressed.as_slice()).unwrap();
            for line in String::from_utf8(decoded).unwrap().lines() {
                if !line.is_empty() {
                    records.push(serde_json::from_str(line).unwrap());
                }
            }
        }
        records
    }

    /// Raw bytes of one member, zstd-decoded when the name says so.
    pub fn member_bytes(&mut self, name: &str) -> Vec<u8> {
        let mut member = self.archive.by_name(name).unwrap();
        let mut bytes = Vec::new();
        member.read_to_end(&mut bytes).unwrap();
        if name.ends_with(".zst") {
            zstd::stream::decode_all(bytes.as_slice()).unwrap()
        } else {
            bytes
        }
    }
}

fn read_json(archive: &mut zip::ZipArchive<std::fs::File>, name: &str) -> Value {
    let mut member = archive.by_name(name).unwrap();
    let mut bytes = Vec::new();
    member.read_to_end(&mut bytes).unwrap();
    serde_json::from_slice(&bytes).unwrap()
}
