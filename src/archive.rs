//! Access to the members of a PMC bulk tar(.gz) bundle.
//!
//! A gzip stream can't be seeked, so the bundle is unpacked once into a
//! staging directory next to it and workers read staged files concurrently.
//! A staging directory left behind by a completed earlier run is reused
//! as-is; one without the completion marker is unpacked again.

use std::{
    collections::{HashMap, HashSet},
    fs::{self, File},
    io::{BufRead, BufReader, Read},
    path::{Component, Path, PathBuf},
    time::Instant,
};

use flate2::read::GzDecoder;
use glob::{glob, Pattern};
use log::{debug, info, warn};

use crate::error::{ArchiveError, MemberError};

const GZIP_MAGIC: [u8; 2] = [0x1f, 0x8b];

/// Written into the staging directory once every member is unpacked.
const COMPLETE_MARKER: &str = ".extracted";

/// Anything that can hand out the raw bytes of a named archive member.
///
/// Implementations are shared by reference across worker threads.
pub trait MemberSource: Sync {
    fn read_member(&self, member: &str) -> Result<Vec<u8>, MemberError>;
}

#[derive(Debug)]
pub struct TarArchive {
    archive_path: PathBuf,
    staging_dir: PathBuf,
    members: HashSet<String>,
    by_file_name: HashMap<String, Vec<String>>,
    reused: bool,
}

impl TarArchive {
    /// Opens `archive_path`, staging it into [`TarArchive::staging_dir_for`].
    pub fn open(archive_path: &Path) -> Result<Self, ArchiveError> {
        Self::open_in(archive_path, &Self::staging_dir_for(archive_path))
    }

    pub fn open_in(archive_path: &Path, staging_dir: &Path) -> Result<Self, ArchiveError> {
        if !archive_path.is_file() {
            return Err(ArchiveError::Open {
                path: archive_path.to_path_buf(),
                source: std::io::Error::new(std::io::ErrorKind::NotFound, "no such file"),
            });
        }

        let reused = staging_dir.join(COMPLETE_MARKER).is_file();
        if !reused && dir_has_entries(staging_dir) {
            warn!(
                "Staging directory {} is from an interrupted extraction, unpacking again",
                staging_dir.display()
            );
            fs::remove_dir_all(staging_dir).map_err(|source| ArchiveError::Staging {
                path: staging_dir.to_path_buf(),
                source,
            })?;
        }
        let members = if reused {
            info!(
                "Reusing previously extracted files in {}",
                staging_dir.display()
            );
            index_staged(staging_dir)?
        } else {
            info!(
                "Extracting {} into {}",
                archive_path.display(),
                staging_dir.display()
            );
            let start = Instant::now();
            let members = unpack(archive_path, staging_dir)?;
            fs::write(staging_dir.join(COMPLETE_MARKER), b"").map_err(|source| {
                ArchiveError::Staging {
                    path: staging_dir.to_path_buf(),
                    source,
                }
            })?;
            info!(
                "Extracted {} members in {:.1}s",
                members.len(),
                start.elapsed().as_secs_f64()
            );
            members
        };
        if members.is_empty() {
            return Err(ArchiveError::NoMembers(archive_path.to_path_buf()));
        }

        let mut by_file_name: HashMap<String, Vec<String>> = HashMap::new();
        for member in &members {
            by_file_name
                .entry(file_name_of(member).to_string())
                .or_default()
                .push(member.clone());
        }

        Ok(Self {
            archive_path: archive_path.to_path_buf(),
            staging_dir: staging_dir.to_path_buf(),
            members: members.into_iter().collect(),
            by_file_name,
            reused,
        })
    }

    /// `<dir>/<file name without .tar.gz, .tgz or .tar>`
    pub fn staging_dir_for(archive_path: &Path) -> PathBuf {
        let name = archive_path
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_default();
        let stem = [".tar.gz", ".tgz", ".tar"]
            .iter()
            .find_map(|ext| name.strip_suffix(ext))
            .unwrap_or(&name);
        let stem = if stem.is_empty() || stem == name {
            format!("{}_extracted", name)
        } else {
            stem.to_string()
        };
        archive_path
            .parent()
            .unwrap_or_else(|| Path::new("."))
            .join(stem)
    }

    pub fn archive_path(&self) -> &Path {
        &self.archive_path
    }

    pub fn staging_dir(&self) -> &Path {
        &self.staging_dir
    }

    /// True when the staging directory already existed when the archive was opened.
    pub fn reused(&self) -> bool {
        self.reused
    }

    pub fn member_count(&self) -> usize {
        self.members.len()
    }

    pub fn cleanup(&self) -> std::io::Result<()> {
        info!("Removing extracted files in {}", self.staging_dir.display());
        fs::remove_dir_all(&self.staging_dir)
    }

    /// Maps a manifest path to a staged member. Tries an exact match, then
    /// archive paths ending in the manifest path, then a unique file name.
    fn resolve(&self, member: &str) -> Result<PathBuf, MemberError> {
        let member = normalize(member);
        if Path::new(&member)
            .components()
            .any(|c| matches!(c, Component::ParentDir))
        {
            return Err(MemberError::UnsafePath);
        }
        if self.members.contains(&member) {
            return Ok(self.staging_dir.join(&member));
        }

        let candidates = self
            .by_file_name
            .get(file_name_of(&member))
            .ok_or(MemberError::NotFound)?;
        let suffix = format!("/{}", member);
        let suffixed: Vec<&String> = candidates
            .iter()
            .filter(|c| c.ends_with(&suffix))
            .collect();
        let hit = match (suffixed.as_slice(), candidates.as_slice()) {
            ([one], _) => *one,
            ([], [only]) => only,
            ([], many) => return Err(MemberError::Ambiguous(many.len())),
            (many, _) => return Err(MemberError::Ambiguous(many.len())),
        };
        Ok(self.staging_dir.join(hit))
    }
}

impl MemberSource for TarArchive {
    fn read_member(&self, member: &str) -> Result<Vec<u8>, MemberError> {
        let path = self.resolve(member)?;
        Ok(fs::read(path)?)
    }
}

fn normalize(path: &str) -> String {
    let mut path = path.trim();
    while let Some(rest) = path.strip_prefix("./") {
        path = rest;
    }
    path.trim_start_matches('/').replace('\\', "/")
}

fn file_name_of(path: &str) -> &str {
    path.rsplit('/').next().unwrap_or(path)
}

fn dir_has_entries(dir: &Path) -> bool {
    fs::read_dir(dir)
        .map(|mut entries| entries.next().is_some())
        .unwrap_or(false)
}

fn unpack(archive_path: &Path, staging_dir: &Path) -> Result<Vec<String>, ArchiveError> {
    let open_error = |source| ArchiveError::Open {
        path: archive_path.to_path_buf(),
        source,
    };

    let file = File::open(archive_path).map_err(open_error)?;
    let mut buffered = BufReader::new(file);
    let is_gzip = buffered.fill_buf().map_err(open_error)?.starts_with(&GZIP_MAGIC);
    let reader: Box<dyn Read> = if is_gzip {
        Box::new(GzDecoder::new(buffered))
    } else {
        Box::new(buffered)
    };

    fs::create_dir_all(staging_dir).map_err(|source| ArchiveError::Staging {
        path: staging_dir.to_path_buf(),
        source,
    })?;

    let mut archive = tar::Archive::new(reader);
    let entries = archive.entries().map_err(open_error)?;
    let mut members = Vec::new();

    for entry in entries {
        let mut entry = match entry {
            Ok(entry) => entry,
            Err(e) if members.is_empty() => return Err(open_error(e)),
            Err(e) => {
                warn!(
                    "Archive stream ended with an error after {} members: {}. \
                     Remaining members will be reported as missing.",
                    members.len(),
                    e
                );
                break;
            }
        };
        if !entry.header().entry_type().is_file() {
            continue;
        }
        let member = match entry.path() {
            Ok(path) => normalize(&path.to_string_lossy()),
            Err(e) => {
                warn!("Skipping archive entry with unreadable path: {}", e);
                continue;
            }
        };
        match entry.unpack_in(staging_dir) {
            Ok(true) => members.push(member),
            Ok(false) => warn!("Skipping archive entry {} outside the staging root", member),
            Err(e) if members.is_empty() => return Err(open_error(e)),
            Err(e) => {
                warn!("Failed to unpack {}: {}. Stopping extraction.", member, e);
                break;
            }
        }
    }
    Ok(members)
}

fn index_staged(staging_dir: &Path) -> Result<Vec<String>, ArchiveError> {
    let pattern = Path::new(&Pattern::escape(&staging_dir.to_string_lossy())).join("**/*");
    let pattern_str = pattern.to_string_lossy();
    debug!("Indexing staged files matching {}", pattern_str);

    let mut members = Vec::new();
    for path in glob(&pattern_str)
        .map_err(|e| ArchiveError::Index(e.to_string()))?
        .filter_map(Result::ok)
    {
        if !path.is_file() {
            continue;
        }
        if let Ok(rel) = path.strip_prefix(staging_dir) {
            let rel = rel
                .components()
                .map(|c| c.as_os_str().to_string_lossy())
                .collect::<Vec<_>>()
                .join("/");
            if rel != COMPLETE_MARKER {
                members.push(rel);
            }
        }
    }
    Ok(members)
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use flate2::{write::GzEncoder, Compression};

    pub(crate) fn build_tar_gz(path: &Path, files: &[(&str, &[u8])]) {
        let file = File::create(path).unwrap();
        let encoder = GzEncoder::new(file, Compression::default());
        let mut builder = tar::Builder::new(encoder);
        for (name, data) in files {
            let mut header = tar::Header::new_gnu();
            header.set_size(data.len() as u64);
            header.set_mode(0o644);
            header.set_cksum();
            builder.append_data(&mut header, name, *data).unwrap();
        }
        builder.into_inner().unwrap().finish().unwrap();
    }

    #[test]
    fn staging_dir_strips_archive_extensions() {
        assert_eq!(
            TarArchive::staging_dir_for(Path::new("/data/oa_comm.PMC000xxxxxx.tar.gz")),
            PathBuf::from("/data/oa_comm.PMC000xxxxxx")
        );
        assert_eq!(
            TarArchive::staging_dir_for(Path::new("/data/bundle.tgz")),
            PathBuf::from("/data/bundle")
        );
        assert_eq!(
            TarArchive::staging_dir_for(Path::new("/data/blob")),
            PathBuf::from("/data/blob_extracted")
        );
    }

    #[test]
    fn reads_members_by_exact_suffix_and_file_name() {
        let dir = tempfile::tempdir().unwrap();
        let tar_path = dir.path().join("bundle.tar.gz");
        build_tar_gz(
            &tar_path,
            &[
                ("oa_comm/xml/PMC000xxxxxx/PMC1.xml", b"one"),
                ("oa_comm/xml/PMC000xxxxxx/PMC2.xml", b"two"),
            ],
        );

        let archive = TarArchive::open(&tar_path).unwrap();
        assert_eq!(archive.member_count(), 2);
        assert_eq!(archive.archive_path(), tar_path.as_path());
        assert!(!archive.reused());
        assert_eq!(
            archive.read_member("oa_comm/xml/PMC000xxxxxx/PMC1.xml").unwrap(),
            b"one"
        );
        assert_eq!(archive.read_member("PMC000xxxxxx/PMC2.xml").unwrap(), b"two");
        assert_eq!(archive.read_member("elsewhere/PMC2.xml").unwrap(), b"two");
        assert!(matches!(
            archive.read_member("PMC000xxxxxx/PMC3.xml"),
            Err(MemberError::NotFound)
        ));
        assert!(matches!(
            archive.read_member("../PMC1.xml"),
            Err(MemberError::UnsafePath)
        ));

        archive.cleanup().unwrap();
        assert!(!archive.staging_dir().exists());
    }

    #[test]
    fn duplicate_file_names_are_ambiguous_without_a_suffix_match() {
        let dir = tempfile::tempdir().unwrap();
        let tar_path = dir.path().join("bundle.tar.gz");
        build_tar_gz(&tar_path, &[("a/PMC1.xml", b"a"), ("b/PMC1.xml", b"b")]);

        let archive = TarArchive::open(&tar_path).unwrap();
        assert_eq!(archive.read_member("b/PMC1.xml").unwrap(), b"b");
        assert!(matches!(
            archive.read_member("c/PMC1.xml"),
            Err(MemberError::Ambiguous(2))
        ));
    }

    #[test]
    fn existing_staging_directory_is_reused() {
        let dir = tempfile::tempdir().unwrap();
        let tar_path = dir.path().join("bundle.tar.gz");
        build_tar_gz(&tar_path, &[("x/PMC5.xml", b"five")]);

        let first = TarArchive::open(&tar_path).unwrap();
        assert!(!first.reused());

        let second = TarArchive::open(&tar_path).unwrap();
        assert!(second.reused());
        assert_eq!(second.member_count(), 1);
        assert_eq!(second.read_member("x/PMC5.xml").unwrap(), b"five");
    }

    #[test]
    fn interrupted_staging_directory_is_unpacked_again() {
        let dir = tempfile::tempdir().unwrap();
        let tar_path = dir.path().join("bundle.tar.gz");
        build_tar_gz(&tar_path, &[("d/P1.xml", b"one"), ("d/P2.xml", b"two")]);

        let staging = TarArchive::staging_dir_for(&tar_path);
        fs::create_dir_all(staging.join("d")).unwrap();
        fs::write(staging.join("d/P1.xml"), b"one").unwrap();

        let archive = TarArchive::open(&tar_path).unwrap();
        assert!(!archive.reused());
        assert_eq!(archive.member_count(), 2);
        assert_eq!(archive.read_member("d/P2.xml").unwrap(), b"two");
        assert!(staging.join(COMPLETE_MARKER).is_file());
        assert!(matches!(
            archive.read_member(COMPLETE_MARKER),
            Err(MemberError::NotFound)
        ));

        let again = TarArchive::open(&tar_path).unwrap();
        assert!(again.reused());
        assert_eq!(again.member_count(), 2);
    }

    #[test]
    fn plain_tar_is_accepted() {
        let dir = tempfile::tempdir().unwrap();
        let tar_path = dir.path().join("bundle.tar");
        let mut builder = tar::Builder::new(File::create(&tar_path).unwrap());
        let mut header = tar::Header::new_gnu();
        header.set_size(3);
        header.set_mode(0o644);
        header.set_cksum();
        builder.append_data(&mut header, "d/PMC7.xml", &b"abc"[..]).unwrap();
        builder.into_inner().unwrap();

        let archive = TarArchive::open(&tar_path).unwrap();
        assert_eq!(archive.read_member("d/PMC7.xml").unwrap(), b"abc");
    }

    #[test]
    fn garbage_archive_is_fatal() {
        let dir = tempfile::tempdir().unwrap();
        let tar_path = dir.path().join("broken.tar.gz");
        fs::write(&tar_path, [0x1f, 0x8b, 0x00, 0x01, 0x02, 0x03]).unwrap();
        assert!(TarArchive::open(&tar_path).is_err());
    }

    #[test]
    fn missing_archive_is_fatal() {
        let dir = tempfile::tempdir().unwrap();
        let err = TarArchive::open(&dir.path().join("missing.tar.gz")).unwrap_err();
        assert!(matches!(err, ArchiveError::Open { .. }));
    }
}
