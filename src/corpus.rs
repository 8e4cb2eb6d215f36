//! Seeds, the seed queue and the on-disk corpus store.

use std::{
    fmt, fs,
    path::{Path, PathBuf},
};

use libafl_bolts::Error;

use crate::config::Config;

/// One input retained in the corpus, with the metrics of the execution that
/// produced it.
///
/// The record is immutable after creation except for the two scheduling
/// flags, which only the scheduler touches.
#[derive(Debug, Clone)]
pub struct Seed {
    /// Where the input bytes live on disk.
    pub path: PathBuf,
    /// Unique id, in assignment order.
    pub seed_id: usize,
    /// Total edges hit by the execution that produced this seed.
    pub coverage: u64,
    /// Wall time of that execution, in microseconds.
    pub exec_time_us: u64,
    /// Byte length of the input.
    pub file_size: u64,
    /// Whether the scheduler handed this seed out during the current cycle.
    pub visited: bool,
    /// Recomputed at every cycle start.
    pub favored: bool,
}

impl Seed {
    pub fn new(
        path: PathBuf,
        seed_id: usize,
        coverage: u64,
        exec_time_us: u64,
        file_size: u64,
    ) -> Self {
        Self {
            path,
            seed_id,
            coverage,
            exec_time_us,
            file_size,
            // A fresh seed waits for the next cycle before it is scheduled.
            visited: true,
            favored: false,
        }
    }
}

impl fmt::Display for Seed {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut status = Vec::new();
        if self.favored {
            status.push("favored");
        }
        if self.visited {
            status.push("visited");
        }
        let size = if self.file_size < 1024 {
            format!("{}B", self.file_size)
        } else if self.file_size < 1024 * 1024 {
            format!("{:.1}KB", self.file_size as f64 / 1024.0)
        } else {
            format!("{:.1}MB", self.file_size as f64 / (1024.0 * 1024.0))
        };
        write!(
            f,
            "Seed[{}] path='{}' size={} exec_time={}us coverage={} status=[{}]",
            self.seed_id,
            self.path.display(),
            size,
            self.exec_time_us,
            self.coverage,
            status.join(", ")
        )
    }
}

/// The ordered corpus. Append-only, except that the scheduler re-sorts it at
/// cycle boundaries.
#[derive(Debug, Default)]
pub struct SeedQueue {
    seeds: Vec<Seed>,
}

impl SeedQueue {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.seeds.len()
    }

    pub fn is_empty(&self) -> bool {
        self.seeds.is_empty()
    }

    pub fn get(&self, index: usize) -> &Seed {
        &self.seeds[index]
    }

    pub fn get_mut(&mut self, index: usize) -> &mut Seed {
        &mut self.seeds[index]
    }

    pub fn iter(&self) -> impl Iterator<Item = &Seed> {
        self.seeds.iter()
    }

    pub fn iter_mut(&mut self) -> impl Iterator<Item = &mut Seed> {
        self.seeds.iter_mut()
    }

    /// Appends a new seed, assigning the next id. Seeds are never removed, so
    /// the current length doubles as the assignment counter.
    pub fn add(
        &mut self,
        path: PathBuf,
        coverage: u64,
        exec_time_us: u64,
        file_size: u64,
    ) -> &Seed {
        let seed_id = self.seeds.len();
        self.seeds
            .push(Seed::new(path, seed_id, coverage, exec_time_us, file_size));
        &self.seeds[seed_id]
    }

    /// Orders the queue for a new cycle: favored seeds first, then cheapest
    /// to execute (time times size), ties broken by id.
    pub fn sort_for_cycle(&mut self) {
        self.seeds.sort_by_key(|seed| {
            (
                std::cmp::Reverse(seed.favored),
                seed.exec_time_us.saturating_mul(seed.file_size),
                seed.seed_id,
            )
        });
    }
}

/// The on-disk side of the corpus: the queue and crash directories.
///
/// Inputs saved into either directory are named by the number of files the
/// directory held at the time, so names are dense and monotonically
/// increasing.
#[derive(Debug)]
pub struct CorpusStore {
    queue_dir: PathBuf,
    crashes_dir: PathBuf,
}

impl CorpusStore {
    /// Prepares the output directories: the initial seed corpus is copied
    /// into the queue directory and the crash directory is created.
    pub fn open(config: &Config) -> Result<Self, Error> {
        copy_dir_recursive(&config.seeds_folder, &config.queue_folder)?;
        fs::create_dir_all(&config.crashes_folder)?;
        Ok(Self {
            queue_dir: config.queue_folder.clone(),
            crashes_dir: config.crashes_folder.clone(),
        })
    }

    /// The initial queue entries, sorted by path for a deterministic dry-run
    /// order.
    pub fn initial_inputs(&self) -> Result<Vec<PathBuf>, Error> {
        let mut inputs = Vec::new();
        collect_files(&self.queue_dir, &mut inputs)?;
        inputs.sort();
        Ok(inputs)
    }

    /// Persists an input that covered a new edge.
    pub fn save_queue_input(&self, data: &[u8]) -> Result<PathBuf, Error> {
        save_numbered(&self.queue_dir, data)
    }

    /// Persists a crashing input.
    pub fn save_crash(&self, data: &[u8]) -> Result<PathBuf, Error> {
        save_numbered(&self.crashes_dir, data)
    }

    /// Number of files currently in the queue directory.
    pub fn queue_file_count(&self) -> Result<usize, Error> {
        count_files(&self.queue_dir)
    }
}

fn save_numbered(dir: &Path, data: &[u8]) -> Result<PathBuf, Error> {
    let path = dir.join(count_files(dir)?.to_string());
    fs::write(&path, data)?;
    Ok(path)
}

fn count_files(dir: &Path) -> Result<usize, Error> {
    let mut count = 0;
    for entry in fs::read_dir(dir)? {
        let entry = entry?;
        if entry.file_type()?.is_dir() {
            count += count_files(&entry.path())?;
        } else {
            count += 1;
        }
    }
    Ok(count)
}

fn collect_files(dir: &Path, out: &mut Vec<PathBuf>) -> Result<(), Error> {
    for entry in fs::read_dir(dir)? {
        let entry = entry?;
        let path = entry.path();
        if entry.file_type()?.is_dir() {
            collect_files(&path, out)?;
        } else {
            out.push(path);
        }
    }
    Ok(())
}

fn copy_dir_recursive(from: &Path, to: &Path) -> Result<(), Error> {
    fs::create_dir_all(to)?;
    for entry in fs::read_dir(from)? {
        let entry = entry?;
        let dest = to.join(entry.file_name());
        if entry.file_type()?.is_dir() {
            copy_dir_recursive(&entry.path(), &dest)?;
        } else {
            fs::copy(entry.path(), &dest)?;
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn store_with_seeds(seeds: &[(&str, &[u8])]) -> (tempfile::TempDir, CorpusStore) {
        let dir = tempfile::tempdir().unwrap();
        let seeds_dir = dir.path().join("seeds");
        fs::create_dir(&seeds_dir).unwrap();
        for (name, data) in seeds {
            fs::write(seeds_dir.join(name), data).unwrap();
        }
        let config = Config {
            target: PathBuf::from("/bin/true"),
            target_args: Vec::new(),
            seeds_folder: seeds_dir,
            queue_folder: dir.path().join("queue"),
            crashes_folder: dir.path().join("crashes"),
            current_input: dir.path().join(".cur_input"),
            timeout_ms: 1000,
            debug_child: false,
        };
        let store = CorpusStore::open(&config).unwrap();
        (dir, store)
    }

    #[test]
    fn open_copies_seed_corpus() {
        let (_dir, store) = store_with_seeds(&[("a", b"AAAA"), ("b", b"BB")]);
        let inputs = store.initial_inputs().unwrap();
        assert_eq!(inputs.len(), 2);
        assert_eq!(fs::read(&inputs[0]).unwrap(), b"AAAA");
        assert_eq!(store.queue_file_count().unwrap(), 2);
    }

    #[test]
    fn saved_inputs_get_dense_numeric_names() {
        let (_dir, store) = store_with_seeds(&[("a", b"A"), ("b", b"B")]);

        let first = store.save_queue_input(b"mutant-1").unwrap();
        assert_eq!(first.file_name().unwrap(), "2");
        let second = store.save_queue_input(b"mutant-2").unwrap();
        assert_eq!(second.file_name().unwrap(), "3");
        assert_eq!(store.queue_file_count().unwrap(), 4);

        let crash = store.save_crash(b"CRASH").unwrap();
        assert_eq!(crash.file_name().unwrap(), "0");
        assert_eq!(fs::read(&crash).unwrap(), b"CRASH");
    }

    #[test]
    fn queue_count_tracks_seed_queue_length() {
        let (_dir, store) = store_with_seeds(&[("a", b"A")]);
        let mut queue = SeedQueue::new();
        for path in store.initial_inputs().unwrap() {
            let size = fs::metadata(&path).unwrap().len();
            queue.add(path, 0, 100, size);
        }
        assert_eq!(queue.len(), store.queue_file_count().unwrap());

        let path = store.save_queue_input(b"new").unwrap();
        queue.add(path, 3, 50, 3);
        assert_eq!(queue.len(), store.queue_file_count().unwrap());
    }

    #[test]
    fn queue_assigns_ids_in_insertion_order() {
        let mut queue = SeedQueue::new();
        let a = queue.add(PathBuf::from("a"), 1, 10, 4).seed_id;
        let b = queue.add(PathBuf::from("b"), 2, 20, 8).seed_id;
        assert_eq!((a, b), (0, 1));

        queue.get_mut(0).favored = false;
        queue.get_mut(1).favored = true;
        queue.sort_for_cycle();
        // Ids survive the re-ordering.
        assert_eq!(queue.get(0).seed_id, 1);
        let c = queue.add(PathBuf::from("c"), 3, 30, 2).seed_id;
        assert_eq!(c, 2);
    }

    #[test]
    fn display_summarizes_the_seed() {
        let mut seed = Seed::new(PathBuf::from("queue/0"), 7, 17, 523, 2048);
        seed.favored = true;
        let rendered = seed.to_string();
        assert_eq!(
            rendered,
            "Seed[7] path='queue/0' size=2.0KB exec_time=523us coverage=17 status=[favored, visited]"
        );
    }
}
