//! Piece store: block bookkeeping, verification and file mapping for one torrent.
//!
//! Bookkeeping lives behind one short-lived lock. Hashing and disk I/O run
//! outside it, so pieces being written by different peers proceed
//! concurrently while a single piece is only ever finalized once.

use std::io::SeekFrom;
use std::net::SocketAddr;
use std::num::NonZeroUsize;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use bytes::Bytes;
use lru::LruCache;
use parking_lot::Mutex;
use sha1::{Digest, Sha1};
use tokio::fs::OpenOptions;
use tokio::io::{AsyncReadExt, AsyncSeekExt, AsyncWriteExt};

use super::StorageError;
use crate::torrent::{Bitfield, BlockRequest, PieceIndex, TorrentInfo};

/// Largest block served to a remote peer in one request.
pub const MAX_UPLOAD_REQUEST: u32 = 128 * 1024;

/// Verified pieces kept in memory for serving uploads.
const UPLOAD_CACHE_PIECES: usize = 8;

/// Peers that may hold the same block request during endgame.
const ENDGAME_DUPLICATES: usize = 2;

/// Externally visible piece state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PieceStatus {
    Missing,
    InProgress,
    Verified,
}

/// Result of storing one block.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum BlockOutcome {
    /// Block kept; the piece still has missing blocks
    Stored,
    /// Block was already received or the piece is finished
    Duplicate,
    /// Last block arrived, hash matched and the piece is on disk
    PieceVerified(PieceIndex),
    /// Last block arrived but the hash did not match; the piece was reset
    PieceFailed {
        piece: PieceIndex,
        contributors: Vec<SocketAddr>,
        failures: u32,
    },
}

#[derive(Debug, Clone, PartialEq, Eq)]
enum BlockState {
    Missing,
    Requested(Vec<SocketAddr>),
    Received,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Phase {
    Pending,
    Hashing,
    Verified,
}

#[derive(Debug)]
struct PieceSlot {
    phase: Phase,
    blocks: Vec<BlockState>,
    buffer: Option<Vec<u8>>,
    contributors: Vec<SocketAddr>,
    /// Peers that contributed to an earlier failed attempt
    suspects: Vec<SocketAddr>,
    /// Blocks whose request timed out, with the peer that let it lapse
    stalled: Vec<(usize, SocketAddr)>,
    failures: u32,
}

impl PieceSlot {
    fn new(block_count: usize) -> Self {
        Self {
            phase: Phase::Pending,
            blocks: vec![BlockState::Missing; block_count],
            buffer: None,
            contributors: Vec::new(),
            suspects: Vec::new(),
            stalled: Vec::new(),
            failures: 0,
        }
    }

    fn reset(&mut self) {
        self.phase = Phase::Pending;
        self.blocks.fill(BlockState::Missing);
        self.buffer = None;
        self.contributors.clear();
        self.stalled.clear();
    }
}

#[derive(Debug)]
struct StoreState {
    pieces: Vec<PieceSlot>,
    availability: Vec<u32>,
    verified: Bitfield,
    verified_bytes: u64,
}

/// Disk-backed store for one torrent's pieces.
#[derive(Debug)]
pub struct PieceStore {
    info: Arc<TorrentInfo>,
    root: PathBuf,
    block_size: u32,
    state: Mutex<StoreState>,
    upload_cache: Mutex<LruCache<PieceIndex, Bytes>>,
}

impl PieceStore {
    /// Creates the torrent's files under `root` at their declared lengths.
    ///
    /// Existing files are kept (their content may be restored later) but
    /// resized to the declared length.
    ///
    /// # Errors
    /// - `StorageError::InsufficientSpace` - Target disk lacks room for the missing bytes
    /// - `StorageError::FileAccess` - Directory or file cannot be created
    pub async fn allocate(
        info: Arc<TorrentInfo>,
        root: &Path,
        block_size: u32,
        check_free_space: bool,
    ) -> Result<Self, StorageError> {
        tokio::fs::create_dir_all(root)
            .await
            .map_err(|e| StorageError::file(root, e))?;

        let mut needed = 0u64;
        for file in &info.files {
            let existing = match tokio::fs::metadata(root.join(&file.path)).await {
                Ok(metadata) => metadata.len(),
                Err(_) => 0,
            };
            needed += file.length.saturating_sub(existing);
        }

        if check_free_space
            && let Some(available) = available_space(root).await
            && needed > available
        {
            return Err(StorageError::InsufficientSpace { needed, available });
        }

        for file in &info.files {
            let path = root.join(&file.path);
            if let Some(parent) = path.parent() {
                tokio::fs::create_dir_all(parent)
                    .await
                    .map_err(|e| StorageError::file(parent, e))?;
            }
            let handle = OpenOptions::new()
                .create(true)
                .truncate(false)
                .write(true)
                .open(&path)
                .await
                .map_err(|e| StorageError::file(&path, e))?;
            let current = handle
                .metadata()
                .await
                .map_err(|e| StorageError::file(&path, e))?
                .len();
            if current != file.length {
                handle
                    .set_len(file.length)
                    .await
                    .map_err(|e| StorageError::file(&path, e))?;
            }
        }

        tracing::debug!(
            info_hash = %info.info_hash,
            root = %root.display(),
            files = info.files.len(),
            bytes = info.total_length,
            "Allocated torrent storage"
        );

        Ok(Self::new(info, root.to_path_buf(), block_size))
    }

    fn new(info: Arc<TorrentInfo>, root: PathBuf, block_size: u32) -> Self {
        let block_size = block_size.max(1);
        let pieces = (0..info.piece_count())
            .map(|index| {
                let size = info.piece_size(PieceIndex::new(index));
                PieceSlot::new(size.div_ceil(block_size) as usize)
            })
            .collect();
        let piece_count = info.piece_count();

        Self {
            info,
            root,
            block_size,
            state: Mutex::new(StoreState {
                pieces,
                availability: vec![0; piece_count as usize],
                verified: Bitfield::new(piece_count),
                verified_bytes: 0,
            }),
            upload_cache: Mutex::new(LruCache::new(
                NonZeroUsize::new(UPLOAD_CACHE_PIECES).unwrap_or(NonZeroUsize::MIN),
            )),
        }
    }

    pub fn info(&self) -> &Arc<TorrentInfo> {
        &self.info
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn block_size(&self) -> u32 {
        self.block_size
    }

    pub fn piece_count(&self) -> u32 {
        self.info.piece_count()
    }

    /// Stores a block received from `peer`.
    ///
    /// When the block completes its piece, the piece is hashed: on a match it
    /// is written to disk and marked verified, otherwise every block of the
    /// piece reverts to missing and the failure counter increments.
    ///
    /// # Errors
    /// - `StorageError::OutOfRange` - Offset or length outside the piece, or not block aligned
    /// - `StorageError::FileAccess` / `StorageError::Io` - Writing the verified piece failed
    pub async fn write_block(
        &self,
        peer: SocketAddr,
        piece: PieceIndex,
        offset: u32,
        data: Bytes,
    ) -> Result<BlockOutcome, StorageError> {
        let completed = {
            let mut state = self.state.lock();
            let block = self.block_index(piece, offset, data.len())?;
            let slot = &mut state.pieces[piece.as_usize()];

            if slot.phase != Phase::Pending || slot.blocks[block] == BlockState::Received {
                return Ok(BlockOutcome::Duplicate);
            }

            let piece_size = self.info.piece_size(piece) as usize;
            let buffer = slot.buffer.get_or_insert_with(|| vec![0u8; piece_size]);
            let start = offset as usize;
            buffer[start..start + data.len()].copy_from_slice(&data);
            slot.blocks[block] = BlockState::Received;
            slot.stalled.retain(|(stalled, _)| *stalled != block);
            if !slot.contributors.contains(&peer) {
                slot.contributors.push(peer);
            }

            if slot.blocks.iter().all(|b| *b == BlockState::Received) {
                slot.phase = Phase::Hashing;
                slot.buffer.take()
            } else {
                None
            }
        };

        match completed {
            Some(buffer) => self.finish_piece(piece, buffer).await,
            None => Ok(BlockOutcome::Stored),
        }
    }

    async fn finish_piece(
        &self,
        piece: PieceIndex,
        buffer: Vec<u8>,
    ) -> Result<BlockOutcome, StorageError> {
        let matches = self
            .info
            .expected_hash(piece)
            .is_some_and(|expected| Sha1::digest(&buffer).as_slice() == expected);

        if !matches {
            let mut state = self.state.lock();
            let slot = &mut state.pieces[piece.as_usize()];
            slot.failures += 1;
            let contributors = std::mem::take(&mut slot.contributors);
            for peer in &contributors {
                if !slot.suspects.contains(peer) {
                    slot.suspects.push(*peer);
                }
            }
            slot.reset();
            tracing::warn!(
                info_hash = %self.info.info_hash,
                %piece,
                failures = slot.failures,
                "Piece failed hash verification"
            );
            return Ok(BlockOutcome::PieceFailed {
                piece,
                contributors,
                failures: slot.failures,
            });
        }

        if let Err(e) = self
            .write_range(self.info.piece_offset(piece), &buffer)
            .await
        {
            self.state.lock().pieces[piece.as_usize()].reset();
            return Err(e);
        }

        let mut state = self.state.lock();
        let slot = &mut state.pieces[piece.as_usize()];
        slot.phase = Phase::Verified;
        slot.contributors.clear();
        slot.suspects.clear();
        state.verified.set(piece);
        state.verified_bytes += buffer.len() as u64;
        tracing::trace!(info_hash = %self.info.info_hash, %piece, "Piece verified");
        Ok(BlockOutcome::PieceVerified(piece))
    }

    /// Chooses up to `max_count` blocks to request from `peer`.
    ///
    /// Strict rarest-first over the pieces `peer_pieces` advertises: lowest
    /// availability first, ties by lowest index. Pieces this peer helped
    /// corrupt are skipped while other work exists. A block whose request
    /// to `peer` timed out goes to other holders of the piece, and back to
    /// `peer` only when nobody else advertises it. Once no block is
    /// missing anywhere, blocks already requested from other peers are
    /// duplicated (endgame). Returned blocks are marked requested by `peer`.
    pub fn select_next_blocks(
        &self,
        peer: SocketAddr,
        peer_pieces: &Bitfield,
        max_count: usize,
    ) -> Vec<BlockRequest> {
        if max_count == 0 {
            return Vec::new();
        }

        let mut state = self.state.lock();
        let mut candidates: Vec<usize> = (0..state.pieces.len())
            .filter(|index| {
                state.pieces[*index].phase == Phase::Pending
                    && peer_pieces.has(PieceIndex::new(*index as u32))
            })
            .collect();
        candidates.sort_by_key(|index| (state.availability[*index], *index));

        let mut picked = Vec::new();

        for allow_suspect in [false, true] {
            if allow_suspect && !picked.is_empty() {
                break;
            }
            for &index in &candidates {
                let shared = state.availability[index] > 1;
                let slot = &mut state.pieces[index];
                if slot.suspects.contains(&peer) != allow_suspect {
                    continue;
                }
                for (block, block_state) in slot.blocks.iter_mut().enumerate() {
                    if picked.len() == max_count {
                        return self.to_requests(picked);
                    }
                    if shared && slot.stalled.contains(&(block, peer)) {
                        continue;
                    }
                    if *block_state == BlockState::Missing {
                        *block_state = BlockState::Requested(vec![peer]);
                        picked.push((index, block));
                    }
                }
            }
        }

        let any_missing = state.pieces.iter().any(|slot| {
            slot.phase == Phase::Pending && slot.blocks.contains(&BlockState::Missing)
        });
        if !any_missing {
            for &index in &candidates {
                for (block, block_state) in state.pieces[index].blocks.iter_mut().enumerate() {
                    if picked.len() == max_count {
                        break;
                    }
                    if let BlockState::Requested(peers) = block_state
                        && !peers.contains(&peer)
                        && peers.len() < ENDGAME_DUPLICATES
                    {
                        peers.push(peer);
                        picked.push((index, block));
                    }
                }
            }
        }

        self.to_requests(picked)
    }

    fn to_requests(&self, picked: Vec<(usize, usize)>) -> Vec<BlockRequest> {
        picked
            .into_iter()
            .map(|(index, block)| self.block_request(PieceIndex::new(index as u32), block))
            .collect()
    }

    fn block_request(&self, piece: PieceIndex, block: usize) -> BlockRequest {
        let offset = block as u32 * self.block_size;
        let length = (self.info.piece_size(piece) - offset).min(self.block_size);
        BlockRequest::new(piece, offset, length)
    }

    /// Validates a block position, returning its index within the piece.
    fn block_index(&self, piece: PieceIndex, offset: u32, len: usize) -> Result<usize, StorageError> {
        let out_of_range = || StorageError::OutOfRange {
            piece,
            offset,
            length: len as u32,
        };
        if piece.as_u32() >= self.info.piece_count() || offset % self.block_size != 0 {
            return Err(out_of_range());
        }
        let piece_size = self.info.piece_size(piece);
        if offset >= piece_size {
            return Err(out_of_range());
        }
        let expected = (piece_size - offset).min(self.block_size) as usize;
        if len != expected {
            return Err(out_of_range());
        }
        Ok((offset / self.block_size) as usize)
    }

    /// Returns every block `peer` had requested to the pool.
    pub fn release_peer(&self, peer: SocketAddr) {
        let mut state = self.state.lock();
        for slot in state.pieces.iter_mut().filter(|s| s.phase == Phase::Pending) {
            for block in slot.blocks.iter_mut() {
                release(block, peer);
            }
        }
    }

    /// Returns one block requested from `peer` to the pool.
    pub fn release_block(&self, peer: SocketAddr, request: BlockRequest) {
        let mut state = self.state.lock();
        let Some(slot) = state.pieces.get_mut(request.piece.as_usize()) else {
            return;
        };
        if slot.phase != Phase::Pending {
            return;
        }
        if let Some(block) = slot
            .blocks
            .get_mut((request.offset / self.block_size) as usize)
        {
            release(block, peer);
        }
    }

    /// Returns a block whose request to `peer` timed out.
    ///
    /// The block becomes missing again but is steered away from `peer`
    /// while another peer advertises its piece.
    pub fn expire_block(&self, peer: SocketAddr, request: BlockRequest) {
        let mut state = self.state.lock();
        let Some(slot) = state.pieces.get_mut(request.piece.as_usize()) else {
            return;
        };
        if slot.phase != Phase::Pending {
            return;
        }
        let index = (request.offset / self.block_size) as usize;
        if let Some(block) = slot.blocks.get_mut(index) {
            release(block, peer);
            if !slot.stalled.contains(&(index, peer)) {
                slot.stalled.push((index, peer));
            }
        }
    }

    /// Counts a peer's advertised pieces toward availability.
    pub fn add_peer_pieces(&self, pieces: &Bitfield) {
        let mut state = self.state.lock();
        for piece in pieces.iter_set() {
            if let Some(count) = state.availability.get_mut(piece.as_usize()) {
                *count += 1;
            }
        }
    }

    pub fn remove_peer_pieces(&self, pieces: &Bitfield) {
        let mut state = self.state.lock();
        for piece in pieces.iter_set() {
            if let Some(count) = state.availability.get_mut(piece.as_usize()) {
                *count = count.saturating_sub(1);
            }
        }
    }

    /// Counts one newly announced piece (`have`).
    pub fn add_peer_piece(&self, piece: PieceIndex) {
        if let Some(count) = self.state.lock().availability.get_mut(piece.as_usize()) {
            *count += 1;
        }
    }

    pub fn availability(&self, piece: PieceIndex) -> u32 {
        self.state
            .lock()
            .availability
            .get(piece.as_usize())
            .copied()
            .unwrap_or(0)
    }

    pub fn piece_status(&self, piece: PieceIndex) -> PieceStatus {
        let state = self.state.lock();
        match state.pieces.get(piece.as_usize()) {
            Some(slot) if slot.phase == Phase::Verified => PieceStatus::Verified,
            Some(slot)
                if slot.phase == Phase::Hashing
                    || slot.blocks.iter().any(|b| *b != BlockState::Missing) =>
            {
                PieceStatus::InProgress
            }
            _ => PieceStatus::Missing,
        }
    }

    pub fn is_verified(&self, piece: PieceIndex) -> bool {
        self.state.lock().verified.has(piece)
    }

    pub fn failure_count(&self, piece: PieceIndex) -> u32 {
        self.state
            .lock()
            .pieces
            .get(piece.as_usize())
            .map_or(0, |slot| slot.failures)
    }

    pub fn verified_bitfield(&self) -> Bitfield {
        self.state.lock().verified.clone()
    }

    pub fn verified_count(&self) -> u32 {
        self.state.lock().verified.count()
    }

    pub fn verified_bytes(&self) -> u64 {
        self.state.lock().verified_bytes
    }

    /// True once every piece is verified.
    pub fn is_complete(&self) -> bool {
        self.state.lock().verified.is_full()
    }

    /// Fraction of content bytes verified.
    pub fn progress(&self) -> f64 {
        if self.info.total_length == 0 {
            return 0.0;
        }
        self.verified_bytes() as f64 / self.info.total_length as f64
    }

    /// Drops all buffered, unverified blocks and outstanding requests.
    pub fn discard_unverified(&self) {
        let mut state = self.state.lock();
        for slot in state.pieces.iter_mut().filter(|s| s.phase == Phase::Pending) {
            slot.reset();
        }
    }

    /// Reads a block of a verified piece for upload.
    ///
    /// # Errors
    /// - `StorageError::PieceNotVerified` - Piece not available
    /// - `StorageError::OutOfRange` - Request outside the piece or too large
    pub async fn read_block(
        &self,
        piece: PieceIndex,
        offset: u32,
        length: u32,
    ) -> Result<Bytes, StorageError> {
        if !self.is_verified(piece) {
            return Err(StorageError::PieceNotVerified { index: piece });
        }
        let piece_size = self.info.piece_size(piece);
        let end = offset.checked_add(length);
        if length == 0 || length > MAX_UPLOAD_REQUEST || end.is_none_or(|end| end > piece_size) {
            return Err(StorageError::OutOfRange {
                piece,
                offset,
                length,
            });
        }

        let start = offset as usize;
        let end = start + length as usize;
        if let Some(cached) = self.upload_cache.lock().get(&piece) {
            return Ok(cached.slice(start..end));
        }

        let data = Bytes::from(
            self.read_range(self.info.piece_offset(piece), piece_size as usize)
                .await?,
        );
        self.upload_cache.lock().put(piece, data.clone());
        Ok(data.slice(start..end))
    }

    /// Marks pieces from resume data as verified, re-hashing them from disk
    /// when `recheck` is set. Returns the number of pieces restored.
    ///
    /// Pieces that fail the recheck stay missing.
    pub async fn restore_verified(&self, pieces: &Bitfield, recheck: bool) -> u32 {
        let mut restored = 0;
        for piece in pieces.iter_set() {
            if piece.as_u32() >= self.piece_count() || self.is_verified(piece) {
                continue;
            }
            if recheck && !self.piece_matches_on_disk(piece).await {
                tracing::debug!(
                    info_hash = %self.info.info_hash,
                    %piece,
                    "Resume piece failed recheck"
                );
                continue;
            }

            let size = u64::from(self.info.piece_size(piece));
            let mut state = self.state.lock();
            let slot = &mut state.pieces[piece.as_usize()];
            if slot.phase != Phase::Pending {
                continue;
            }
            slot.phase = Phase::Verified;
            slot.blocks.fill(BlockState::Received);
            slot.buffer = None;
            state.verified.set(piece);
            state.verified_bytes += size;
            restored += 1;
        }
        restored
    }

    async fn piece_matches_on_disk(&self, piece: PieceIndex) -> bool {
        let Some(expected) = self.info.expected_hash(piece) else {
            return false;
        };
        match self
            .read_range(
                self.info.piece_offset(piece),
                self.info.piece_size(piece) as usize,
            )
            .await
        {
            Ok(data) => Sha1::digest(&data).as_slice() == expected,
            Err(_) => false,
        }
    }

    /// Removes the torrent's files from disk.
    ///
    /// # Errors
    /// - `StorageError::FileAccess` - A file exists but cannot be removed
    pub async fn delete_files(&self) -> Result<(), StorageError> {
        self.discard_unverified();
        self.upload_cache.lock().clear();
        remove_torrent_files(&self.info, &self.root).await
    }

    async fn write_range(&self, content_offset: u64, data: &[u8]) -> Result<(), StorageError> {
        let mut written = 0usize;
        for slice in self.info.file_slices(content_offset, data.len() as u64) {
            let path = self.root.join(&self.info.files[slice.file_index].path);
            let mut file = OpenOptions::new()
                .write(true)
                .open(&path)
                .await
                .map_err(|e| StorageError::file(&path, e))?;
            let end = written + slice.length as usize;
            file.seek(SeekFrom::Start(slice.file_offset)).await?;
            file.write_all(&data[written..end]).await?;
            file.flush().await?;
            written = end;
        }
        Ok(())
    }

    async fn read_range(&self, content_offset: u64, length: usize) -> Result<Vec<u8>, StorageError> {
        let mut data = vec![0u8; length];
        let mut filled = 0usize;
        for slice in self.info.file_slices(content_offset, length as u64) {
            let path = self.root.join(&self.info.files[slice.file_index].path);
            let mut file = tokio::fs::File::open(&path)
                .await
                .map_err(|e| StorageError::file(&path, e))?;
            let end = filled + slice.length as usize;
            file.seek(SeekFrom::Start(slice.file_offset)).await?;
            file.read_exact(&mut data[filled..end]).await?;
            filled = end;
        }
        Ok(data)
    }
}

fn release(block: &mut BlockState, peer: SocketAddr) {
    if let BlockState::Requested(peers) = block {
        peers.retain(|p| *p != peer);
        if peers.is_empty() {
            *block = BlockState::Missing;
        }
    }
}

/// Removes a torrent's files under `root` plus directories left empty.
///
/// # Errors
/// - `StorageError::FileAccess` - A file exists but cannot be removed
pub async fn remove_torrent_files(info: &TorrentInfo, root: &Path) -> Result<(), StorageError> {
    for file in &info.files {
        let path = root.join(&file.path);
        match tokio::fs::remove_file(&path).await {
            Ok(()) => {}
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
            Err(e) => return Err(StorageError::file(&path, e)),
        }

        let mut dir = path.parent();
        while let Some(current) = dir {
            if current == root || !current.starts_with(root) {
                break;
            }
            // Stops at the first directory that still has entries
            if tokio::fs::remove_dir(current).await.is_err() {
                break;
            }
            dir = current.parent();
        }
    }
    tracing::debug!(info_hash = %info.info_hash, root = %root.display(), "Removed torrent files");
    Ok(())
}

/// Free bytes on the disk holding `path`, if it can be determined.
async fn available_space(path: &Path) -> Option<u64> {
    let target = tokio::fs::canonicalize(path).await.ok()?;
    tokio::task::spawn_blocking(move || {
        let disks = sysinfo::Disks::new_with_refreshed_list();
        disks
            .list()
            .iter()
            .filter(|disk| target.starts_with(disk.mount_point()))
            .max_by_key(|disk| disk.mount_point().as_os_str().len())
            .map(|disk| disk.available_space())
    })
    .await
    .ok()
    .flatten()
}
