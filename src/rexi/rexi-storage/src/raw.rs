use std::fs;
use std::io;
use std::path::{Path, PathBuf};
use std::thread::JoinHandle;

use crossbeam_channel::{unbounded, Receiver, Sender, TryRecvError};
use log::{debug, error, info, warn};

use rexi_core::storage::{check_page, BackingStore, StorageError};
use memcard_protocol::card::PAGE_SIZE;

/// Whole-card image in a single file.
///
/// The image lives in memory; `flush` hands a snapshot of it to a writer
/// thread so the emulation never waits on the disk. `wait_idle` is the only
/// place that blocks.
pub struct RawImage {
    path: PathBuf,
    data: Vec<u8>,
    jobs: Option<Sender<Vec<u8>>>,
    results: Receiver<io::Result<()>>,
    outstanding: usize, // flushes handed to the writer, not yet reported back
    worker: Option<JoinHandle<()>>,
}

// Writes every snapshot it receives, replacing the file in one rename
fn writer_thread(path: PathBuf, jobs: Receiver<Vec<u8>>, results: Sender<io::Result<()>>) {
    for image in jobs.iter() {
        let result = write_image(&path, &image);
        if results.send(result).is_err() {
            break;
        }
    }
}

fn write_image(path: &Path, image: &[u8]) -> io::Result<()> {
    let tmp = path.with_extension("tmp");
    fs::write(&tmp, image)?;
    fs::rename(&tmp, path)?;
    debug!("Wrote {} bytes to {}", image.len(), path.display());
    Ok(())
}

impl RawImage {
    /// Loads `path`, or starts from an erased card if it does not exist yet
    pub fn open(path: impl AsRef<Path>, size: usize) -> Result<Self, StorageError> {
        let path = path.as_ref().to_path_buf();
        let data = match fs::read(&path) {
            Ok(mut data) => {
                if data.len() != size {
                    warn!(
                        "{} is {} bytes, expected {}; resizing",
                        path.display(),
                        data.len(),
                        size
                    );
                    data.resize(size, 0xFF);
                }
                info!("Loaded memory card image {}", path.display());
                data
            }
            Err(err) if err.kind() == io::ErrorKind::NotFound => {
                info!("{} not found, starting with a blank card", path.display());
                vec![0xFF; size]
            }
            Err(err) => return Err(err.into()),
        };

        let (jobs_tx, jobs_rx) = unbounded();
        let (results_tx, results_rx) = unbounded();
        let worker_path = path.clone();
        let worker = std::thread::spawn(move || writer_thread(worker_path, jobs_rx, results_tx));

        Ok(Self {
            path,
            data,
            jobs: Some(jobs_tx),
            results: results_rx,
            outstanding: 0,
            worker: Some(worker),
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Collects writer results; `block` waits for all of them
    fn collect(&mut self, block: bool) -> Result<(), StorageError> {
        let mut first_err = None;
        while self.outstanding > 0 {
            let result = if block {
                self.results.recv().map_err(|_| StorageError::WorkerGone)?
            } else {
                match self.results.try_recv() {
                    Ok(result) => result,
                    Err(TryRecvError::Empty) => break,
                    Err(TryRecvError::Disconnected) => return Err(StorageError::WorkerGone),
                }
            };
            self.outstanding -= 1;
            if let Err(err) = result {
                error!("Writing {} failed: {}", self.path.display(), err);
                if first_err.is_none() {
                    first_err = Some(err);
                }
            }
        }
        match first_err {
            Some(err) => Err(err.into()),
            None => Ok(()),
        }
    }
}

impl BackingStore for RawImage {
    fn size(&self) -> usize {
        self.data.len()
    }

    fn read_page(&mut self, page: usize, out: &mut [u8]) -> Result<(), StorageError> {
        check_page(page, out.len(), self.pages())?;
        let start = page * PAGE_SIZE;
        out.copy_from_slice(&self.data[start..start + PAGE_SIZE]);
        Ok(())
    }

    fn write_page(&mut self, page: usize, data: &[u8]) -> Result<(), StorageError> {
        check_page(page, data.len(), self.pages())?;
        let start = page * PAGE_SIZE;
        self.data[start..start + PAGE_SIZE].copy_from_slice(data);
        Ok(())
    }

    fn flush(&mut self) -> Result<(), StorageError> {
        // Report failures of earlier flushes so the card retries
        self.collect(false)?;
        let jobs = self.jobs.as_ref().ok_or(StorageError::WorkerGone)?;
        jobs.send(self.data.clone())
            .map_err(|_| StorageError::WorkerGone)?;
        self.outstanding += 1;
        Ok(())
    }

    fn wait_idle(&mut self) -> Result<(), StorageError> {
        self.collect(true)
    }
}

impl Drop for RawImage {
    fn drop(&mut self) {
        // Closing the job channel lets the writer finish its queue and exit
        self.jobs.take();
        if let Some(worker) = self.worker.take() {
            if worker.join().is_err() {
                error!("Writer thread for {} panicked", self.path.display());
            }
        }
    }
}
