//! The acceptor is the durable memory of the Paxos protocol.  It persists adopted ballots,
//! accepted pvalues, and garbage-collection watermarks in append-only log segments so that a
//! restart never retracts a promise or loses an accepted value, and it publishes how far that
//! persistence has progressed so network replies can be deferred until durable.

use std::collections::VecDeque;
use std::fs::{create_dir, read_dir, rename, File, OpenOptions};
use std::io::{Read, Write};
use std::path::{Path, PathBuf};
use std::sync::{Arc, Condvar, Mutex};
use std::thread::JoinHandle;

use biometrics::{Collector, Counter};

use indicio::{clue, ERROR, INFO};

use tatl::{HeyListen, Stationary};

use utilz::lockfile::Lockfile;

use zerror::Z;
use zerror_core::ErrorCore;

use replicant_pb::{Ballot, Bootstrap, PValue, Server};

use super::{Error, IoToZ, COLLECTOR};

///////////////////////////////////////////// Constants ////////////////////////////////////////////

/// Rotate to a fresh log segment once the current one exceeds this many bytes.
const SEGMENT_ROTATE_BYTES: u64 = 1 << 26;

/// Always keep at least this many log segments on disk.
const KEEP_SEGMENTS: usize = 2;

/// Always keep at least this many replica snapshots on disk.
const KEEP_SNAPSHOTS: usize = 6;

const RECORD_ADOPT: u8 = b'A';
const RECORD_ACCEPT: u8 = b'B';
const RECORD_GC: u8 = b'G';

#[allow(non_snake_case)]
fn LOCK<P: AsRef<Path>>(root: P) -> PathBuf {
    root.as_ref().to_path_buf().join("LOCK")
}

#[allow(non_snake_case)]
fn IDENTITY<P: AsRef<Path>>(root: P) -> PathBuf {
    root.as_ref().to_path_buf().join("IDENTITY")
}

#[allow(non_snake_case)]
fn ATOMIC_TMP<P: AsRef<Path>>(root: P) -> PathBuf {
    root.as_ref().to_path_buf().join(".atomic.tmp")
}

#[allow(non_snake_case)]
fn LOG<P: AsRef<Path>>(root: P, lognum: u64) -> PathBuf {
    root.as_ref().to_path_buf().join(format!("log.{}", lognum))
}

#[allow(non_snake_case)]
fn REPLICA<P: AsRef<Path>>(root: P, slot: u64) -> PathBuf {
    root.as_ref().to_path_buf().join(format!("replica.{}", slot))
}

//////////////////////////////////////////// biometrics ////////////////////////////////////////////

static ADOPT: Counter = Counter::new("replicant.acceptor.adopt");
static ACCEPT: Counter = Counter::new("replicant.acceptor.accept");
static GARBAGE_COLLECT: Counter = Counter::new("replicant.acceptor.garbage_collect");
static FSYNC: Counter = Counter::new("replicant.acceptor.fsync");
static ROTATE: Counter = Counter::new("replicant.acceptor.rotate");
static SEGMENTS_UNLINKED: Counter = Counter::new("replicant.acceptor.segments_unlinked");
static SNAPSHOTS_UNLINKED: Counter = Counter::new("replicant.acceptor.snapshots_unlinked");

static PERMAFAIL: Counter = Counter::new("replicant.acceptor.permafail");
static PERMAFAIL_MONITOR: Stationary = Stationary::new("replicant.acceptor.permafail", &PERMAFAIL);

pub fn register_biometrics(collector: &Collector) {
    collector.register_counter(&ADOPT);
    collector.register_counter(&ACCEPT);
    collector.register_counter(&GARBAGE_COLLECT);
    collector.register_counter(&FSYNC);
    collector.register_counter(&ROTATE);
    collector.register_counter(&SEGMENTS_UNLINKED);
    collector.register_counter(&SNAPSHOTS_UNLINKED);
    collector.register_counter(&PERMAFAIL);
}

pub fn register_monitors(hey_listen: &mut HeyListen) {
    hey_listen.register_stationary(&PERMAFAIL_MONITOR);
}

////////////////////////////////////////// directory scans /////////////////////////////////////////

fn numbered_files(root: &Path, prefix: &str) -> Result<Vec<u64>, Error> {
    let mut numbers = Vec::new();
    for entry in read_dir(root)? {
        let entry = entry?;
        let name = entry.file_name();
        let Some(name) = name.to_str() else {
            continue;
        };
        if let Some(digits) = name.strip_prefix(prefix) {
            if !digits.is_empty() && digits.chars().all(|c| c.is_ascii_digit()) {
                if let Ok(number) = digits.parse::<u64>() {
                    numbers.push(number);
                }
            }
        }
    }
    numbers.sort_unstable();
    Ok(numbers)
}

////////////////////////////////////////////// replay //////////////////////////////////////////////

/// Replay one log segment, folding its records into the provided state.  Any malformed record is
/// an error:  the log is the ground truth of promises made and cannot be guessed at.
fn replay_log(
    root: &Path,
    lognum: u64,
    ballot: &mut Ballot,
    pvals: &mut Vec<PValue>,
    lowest_acceptable_slot: &mut u64,
) -> Result<(), Error> {
    let mut contents = Vec::new();
    File::open(LOG(root, lognum))?.read_to_end(&mut contents)?;
    let mut buf = &contents[..];
    while !buf.is_empty() {
        let tag = buf[0];
        buf = &buf[1..];
        match tag {
            RECORD_ADOPT => {
                let (b, rem) = Ballot::unpack_fixed(buf)?;
                *ballot = std::cmp::max(*ballot, b);
                buf = rem;
            }
            RECORD_ACCEPT => {
                let (p, rem) = PValue::unpack_fixed(buf)?;
                *ballot = std::cmp::max(*ballot, p.ballot);
                pvals.push(p);
                buf = rem;
            }
            RECORD_GC => {
                if buf.len() < 8 {
                    return Err(Error::corruption("truncated gc record"));
                }
                let below = u64::from_be_bytes(buf[..8].try_into().unwrap());
                *lowest_acceptable_slot = std::cmp::max(*lowest_acceptable_slot, below);
                buf = &buf[8..];
            }
            _ => {
                return Err(Error::corruption(format!(
                    "unknown record type {} in log.{}",
                    tag, lognum
                )));
            }
        }
    }
    Ok(())
}

/// Whether the segment holds any records at all.  Used by [Acceptor::open] to distinguish a
/// freshly-created empty segment from real durable state.
fn segment_has_records(root: &Path, lognum: u64) -> Result<bool, Error> {
    Ok(std::fs::metadata(LOG(root, lognum))?.len() > 0)
}

/////////////////////////////////////////////// Syncer /////////////////////////////////////////////

struct SyncRequest {
    lognum: u64,
    file: File,
    written: u64,
    opnum: u64,
}

struct SyncResult {
    lognum: u64,
    written: u64,
    opnum: u64,
    ok: bool,
}

#[derive(Default)]
struct SyncerState {
    requests: VecDeque<SyncRequest>,
    results: Vec<SyncResult>,
    killed: bool,
}

/// The asynchronous-fsync engine.  Writes buffer into the segment; the syncer thread issues
/// `fdatasync` behind them; completion advances the segment's durable cut.  At most one fsync per
/// segment is in flight at a time, mirroring the aio discipline of the original.
struct Syncer {
    state: Arc<(Mutex<SyncerState>, Condvar)>,
    thread: Option<JoinHandle<()>>,
}

impl Syncer {
    fn new() -> Self {
        let state = Arc::new((Mutex::new(SyncerState::default()), Condvar::new()));
        let thread_state = Arc::clone(&state);
        let thread = std::thread::spawn(move || Self::run(thread_state));
        Self {
            state,
            thread: Some(thread),
        }
    }

    fn run(state: Arc<(Mutex<SyncerState>, Condvar)>) {
        let (mtx, cnd) = &*state;
        let mut guard = mtx.lock().unwrap();
        loop {
            while guard.requests.is_empty() && !guard.killed {
                guard = cnd.wait(guard).unwrap();
            }
            if guard.killed {
                break;
            }
            let req = guard.requests.pop_front().unwrap();
            drop(guard);
            FSYNC.click();
            let ok = req.file.sync_data().is_ok();
            guard = mtx.lock().unwrap();
            guard.results.push(SyncResult {
                lognum: req.lognum,
                written: req.written,
                opnum: req.opnum,
                ok,
            });
        }
    }

    fn submit(&self, req: SyncRequest) {
        let (mtx, cnd) = &*self.state;
        mtx.lock().unwrap().requests.push_back(req);
        cnd.notify_one();
    }

    fn take_results(&self) -> Vec<SyncResult> {
        let (mtx, _) = &*self.state;
        std::mem::take(&mut mtx.lock().unwrap().results)
    }
}

impl Drop for Syncer {
    fn drop(&mut self) {
        let (mtx, cnd) = &*self.state;
        mtx.lock().unwrap().killed = true;
        cnd.notify_one();
        if let Some(thread) = self.thread.take() {
            let _ = thread.join();
        }
    }
}

//////////////////////////////////////////// LogSegment ////////////////////////////////////////////

struct LogSegment {
    lognum: u64,
    file: File,
    written: u64,
    synced: u64,
    sync_op: u64,
    sync_in_progress: bool,
    permafail: bool,
}

impl LogSegment {
    fn open(root: &Path, lognum: u64) -> Result<Self, Error> {
        let file = OpenOptions::new()
            .write(true)
            .create_new(true)
            .open(LOG(root, lognum))?;
        Ok(Self {
            lognum,
            file,
            written: 0,
            synced: 0,
            sync_op: 0,
            sync_in_progress: false,
            permafail: false,
        })
    }

    fn write_ballot(&mut self, b: &Ballot) -> bool {
        let mut buf = vec![RECORD_ADOPT];
        b.pack_fixed(&mut buf);
        self.write(&buf)
    }

    fn write_pval(&mut self, p: &PValue) -> bool {
        let mut buf = vec![RECORD_ACCEPT];
        p.pack_fixed(&mut buf);
        self.write(&buf)
    }

    fn write_gc(&mut self, below: u64) -> bool {
        let mut buf = vec![RECORD_GC];
        buf.extend_from_slice(&below.to_be_bytes());
        self.write(&buf)
    }

    fn write(&mut self, buf: &[u8]) -> bool {
        self.written += buf.len() as u64;
        if self.file.write_all(buf).is_err() {
            self.permafail = true;
            return false;
        }
        true
    }

    fn all_synced(&self) -> bool {
        !self.permafail && self.written == self.synced
    }

    /// Absorb any completed fsync and, when there is unsynced data with no fsync in flight, start
    /// another.  `opnum` is the operation whose writes the next fsync will cover.
    fn maybe_sync(&mut self, syncer: &Syncer, opnum: u64) {
        if self.permafail || self.sync_in_progress {
            return;
        }
        if self.written <= self.synced {
            return;
        }
        let Ok(file) = self.file.try_clone() else {
            self.permafail = true;
            return;
        };
        syncer.submit(SyncRequest {
            lognum: self.lognum,
            file,
            written: self.written,
            opnum,
        });
        self.sync_in_progress = true;
    }

    fn absorb(&mut self, result: SyncResult) {
        assert_eq!(self.lognum, result.lognum);
        self.sync_in_progress = false;
        if !result.ok {
            clue!(COLLECTOR, ERROR, {
                acceptor_fsync_failed: self.lognum,
            });
            self.permafail = true;
            return;
        }
        self.synced = result.written;
        self.sync_op = result.opnum;
    }

    fn sync_cut(&self) -> u64 {
        self.sync_op
    }
}

///////////////////////////////////////// GarbageCollector /////////////////////////////////////////

#[derive(Default)]
struct GcState {
    below_lognum: u64,
    below_slot: u64,
    collected: u64,
    killed: bool,
}

/// Deletes obsolete `log.<n>` segments and `replica.<slot>` snapshots in the background.  A
/// segment is obsolete when its highest accepted slot is below the cluster gc floor and newer
/// segments exist; the newest [KEEP_SEGMENTS] segments and [KEEP_SNAPSHOTS] snapshots always
/// survive.
struct GarbageCollector {
    state: Arc<(Mutex<GcState>, Condvar)>,
    thread: Option<JoinHandle<()>>,
}

impl GarbageCollector {
    fn new(root: PathBuf) -> Self {
        let state = Arc::new((Mutex::new(GcState::default()), Condvar::new()));
        let thread_state = Arc::clone(&state);
        let thread = std::thread::spawn(move || Self::run(root, thread_state));
        Self {
            state,
            thread: Some(thread),
        }
    }

    fn gc(&self, below_lognum: u64, below_slot: u64) {
        let (mtx, cnd) = &*self.state;
        let mut state = mtx.lock().unwrap();
        state.below_lognum = below_lognum;
        state.below_slot = below_slot;
        cnd.notify_one();
    }

    fn run(root: PathBuf, state: Arc<(Mutex<GcState>, Condvar)>) {
        let (mtx, cnd) = &*state;
        let mut guard = mtx.lock().unwrap();
        loop {
            while guard.collected >= guard.below_slot && !guard.killed {
                guard = cnd.wait(guard).unwrap();
            }
            if guard.killed {
                break;
            }
            let below_lognum = guard.below_lognum;
            let below_slot = guard.below_slot;
            drop(guard);
            Self::collect(&root, below_lognum, below_slot);
            guard = mtx.lock().unwrap();
            guard.collected = below_slot;
        }
    }

    fn collect(root: &Path, below_lognum: u64, below_slot: u64) {
        let Ok(lognums) = numbered_files(root, "log.") else {
            return;
        };
        let Ok(replicas) = numbered_files(root, "replica.") else {
            return;
        };
        for (i, &lognum) in lognums.iter().enumerate() {
            if i + KEEP_SEGMENTS >= lognums.len() || lognum >= below_lognum {
                break;
            }
            let mut ballot = Ballot::BOTTOM;
            let mut pvals = Vec::new();
            let mut las = 0;
            if replay_log(root, lognum, &mut ballot, &mut pvals, &mut las).is_err() {
                return;
            }
            let highest_slot = pvals.iter().map(|p| p.slot).max().unwrap_or(0);
            if highest_slot >= below_slot {
                break;
            }
            if std::fs::remove_file(LOG(root, lognum)).is_err() {
                return;
            }
            SEGMENTS_UNLINKED.click();
        }
        for (i, &slot) in replicas.iter().enumerate() {
            if i + KEEP_SNAPSHOTS >= replicas.len() || slot >= below_slot {
                break;
            }
            if std::fs::remove_file(REPLICA(root, slot)).is_err() {
                return;
            }
            SNAPSHOTS_UNLINKED.click();
        }
    }
}

impl Drop for GarbageCollector {
    fn drop(&mut self) {
        let (mtx, cnd) = &*self.state;
        mtx.lock().unwrap().killed = true;
        cnd.notify_one();
        if let Some(thread) = self.thread.take() {
            let _ = thread.join();
        }
    }
}

///////////////////////////////////////////// Acceptor /////////////////////////////////////////////

/// The durable half of a Paxos acceptor.  Owns the data directory exclusively for the life of the
/// process.
pub struct Acceptor {
    root: PathBuf,
    dir: File,
    _lockfile: Lockfile,
    ballot: Ballot,
    pvals: Vec<PValue>,
    lowest_acceptable_slot: u64,
    opcount: u64,
    permafail: bool,
    current: LogSegment,
    previous: Option<LogSegment>,
    syncer: Syncer,
    gc: GarbageCollector,
}

impl Acceptor {
    /// Open (and possibly create) the data directory, replay all durable state, and open a fresh
    /// log segment for writing.  Returns the acceptor and, when an identity was previously saved,
    /// the saved server and bootstrap.
    pub fn open<P: AsRef<Path>>(
        root: P,
    ) -> Result<(Acceptor, Option<(Server, Bootstrap)>), Error> {
        let root = root.as_ref().to_path_buf();
        if !root.is_dir() {
            create_dir(&root)
                .as_z()
                .with_info("root", root.to_string_lossy())?;
        }
        let lockfile = Lockfile::lock(LOCK(&root))
            .as_z()
            .with_info("root", root.to_string_lossy())?;
        let Some(lockfile) = lockfile else {
            return Err(Error::LockNotObtained {
                core: ErrorCore::default(),
                path: LOCK(&root).to_string_lossy().to_string(),
            });
        };
        let dir = File::open(&root)?;
        let saved = match std::fs::read_to_string(IDENTITY(&root)) {
            Ok(ident) => Some(Self::parse_identity(&ident)?),
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => None,
            Err(err) => {
                return Err(err.into());
            }
        };
        let mut ballot = Ballot::BOTTOM;
        let mut pvals = Vec::new();
        let mut lowest_acceptable_slot = 0;
        let lognums = numbered_files(&root, "log.")?;
        let mut has_records = false;
        for &lognum in lognums.iter() {
            has_records = has_records || segment_has_records(&root, lognum)?;
            replay_log(
                &root,
                lognum,
                &mut ballot,
                &mut pvals,
                &mut lowest_acceptable_slot,
            )?;
        }
        let has_snapshots = !numbered_files(&root, "replica.")?.is_empty();
        if saved.is_none() && (has_records || has_snapshots) {
            return Err(Error::corruption(
                "acceptor state exists without an identity; refusing to run on a tampered directory",
            ));
        }
        if saved.is_some() && !has_records && !has_snapshots {
            return Err(Error::corruption(
                "identity exists without acceptor state; refusing to run on a tampered directory",
            ));
        }
        let next_lognum = lognums.last().map(|x| x + 1).unwrap_or(0);
        let current = LogSegment::open(&root, next_lognum)?;
        let gc = GarbageCollector::new(root.clone());
        let mut acceptor = Acceptor {
            root,
            dir,
            _lockfile: lockfile,
            ballot,
            pvals,
            lowest_acceptable_slot,
            opcount: 0,
            permafail: false,
            current,
            previous: None,
            syncer: Syncer::new(),
            gc,
        };
        acceptor.compact_pvals();
        Ok((acceptor, saved))
    }

    /// Atomically record who we are and how to find our peers.
    pub fn save(&mut self, us: &Server, bootstrap: &Bootstrap) -> Result<(), Error> {
        let contents = format!("{}\n{}\n", us, bootstrap.conn_str());
        self.atomic_write(&IDENTITY(&self.root), contents.as_bytes())
    }

    pub fn current_ballot(&self) -> Ballot {
        self.ballot
    }

    pub fn lowest_acceptable_slot(&self) -> u64 {
        self.lowest_acceptable_slot
    }

    /// True once any write or fsync has failed.  A failed acceptor never recovers.
    pub fn failed(&self) -> bool {
        self.permafail || self.current.permafail
    }

    /// The op counter after the most recent buffered write.  Pair with [Acceptor::sync_cut] to
    /// defer sends until durable.
    pub fn write_cut(&self) -> u64 {
        self.opcount
    }

    /// The accepted pvalues, compacted:  for each slot at or above the gc floor, only the
    /// highest-ballot entry, in (slot asc, ballot desc) order.
    pub fn pvals(&mut self) -> &[PValue] {
        self.compact_pvals();
        &self.pvals
    }

    fn compact_pvals(&mut self) {
        self.pvals.sort_by(|lhs, rhs| {
            lhs.slot
                .cmp(&rhs.slot)
                .then_with(|| rhs.ballot.cmp(&lhs.ballot))
        });
        let mut compacted: Vec<PValue> = Vec::with_capacity(self.pvals.len());
        for pval in self.pvals.drain(..) {
            if pval.slot < self.lowest_acceptable_slot {
                continue;
            }
            if compacted.last().map(|p| p.slot) == Some(pval.slot) {
                continue;
            }
            compacted.push(pval);
        }
        self.pvals = compacted;
    }

    /// Durably adopt a new ballot.  Precondition:  the ballot supersedes the current one.
    pub fn adopt(&mut self, b: Ballot) {
        assert!(!self.failed());
        assert!(b > self.ballot);
        ADOPT.click();
        self.opcount += 1;
        let opcount = self.opcount;
        let wrote = match self.get_writable_log() {
            Some(log) => log.write_ballot(&b),
            None => false,
        };
        if wrote {
            self.ballot = b;
            self.pump_syncs(opcount);
        } else {
            self.fail_permanently();
        }
    }

    /// Durably accept a pvalue.  Precondition:  proposed under the current ballot at an
    /// acceptable slot.
    pub fn accept(&mut self, p: PValue) {
        assert!(!self.failed());
        assert!(p.ballot == self.ballot);
        assert!(p.slot >= self.lowest_acceptable_slot);
        ACCEPT.click();
        self.opcount += 1;
        let opcount = self.opcount;
        let wrote = match self.get_writable_log() {
            Some(log) => log.write_pval(&p),
            None => false,
        };
        if wrote {
            self.pvals.push(p);
            self.pump_syncs(opcount);
        } else {
            self.fail_permanently();
        }
    }

    /// Durably raise the lowest acceptable slot.  Slots below it are considered permanently
    /// decided and their pvalues may be discarded.
    pub fn garbage_collect(&mut self, below: u64) {
        assert!(!self.failed());
        GARBAGE_COLLECT.click();
        let below = std::cmp::max(self.lowest_acceptable_slot, below);
        self.opcount += 1;
        let opcount = self.opcount;
        let wrote = match self.get_writable_log() {
            Some(log) => log.write_gc(below),
            None => false,
        };
        if wrote {
            self.lowest_acceptable_slot = below;
            self.pump_syncs(opcount);
            let mut lognum = self.current.lognum;
            if let Some(previous) = &self.previous {
                lognum = std::cmp::min(lognum, previous.lognum);
            }
            self.gc.gc(lognum, below);
            self.compact_pvals();
        } else {
            self.fail_permanently();
        }
    }

    /// The op-counter value at or below which every previously-buffered write is durable.
    pub fn sync_cut(&mut self) -> u64 {
        self.opcount += 1;
        let opcount = self.opcount;
        self.pump_syncs(opcount);
        if let Some(previous) = &self.previous {
            if !previous.all_synced() {
                return previous.sync_cut();
            }
        }
        self.previous = None;
        self.current.sync_cut()
    }

    /// Atomically record the replica snapshot taken at `slot`.
    pub fn record_snapshot(&mut self, slot: u64, snapshot: &[u8]) -> Result<(), Error> {
        self.atomic_write(&REPLICA(&self.root, slot), snapshot)
    }

    /// Read back the highest-slot replica snapshot, if any.
    pub fn load_latest_snapshot(&self) -> Result<Option<(u64, Vec<u8>)>, Error> {
        let Some(&slot) = numbered_files(&self.root, "replica.")?.last() else {
            return Ok(None);
        };
        let mut contents = Vec::new();
        File::open(REPLICA(&self.root, slot))?.read_to_end(&mut contents)?;
        Ok(Some((slot, contents)))
    }

    fn fail_permanently(&mut self) {
        if !self.permafail {
            PERMAFAIL.click();
            clue!(COLLECTOR, ERROR, {
                acceptor_permafail: true,
            });
        }
        self.permafail = true;
    }

    /// Route completed fsyncs to their segments and keep the pipeline primed.
    fn pump_syncs(&mut self, opnum: u64) {
        for result in self.syncer.take_results() {
            if result.lognum == self.current.lognum {
                self.current.absorb(result);
            } else if self.previous.as_ref().map(|p| p.lognum) == Some(result.lognum) {
                self.previous.as_mut().unwrap().absorb(result);
            }
        }
        let mut previous_failed = false;
        if let Some(previous) = &mut self.previous {
            previous.maybe_sync(&self.syncer, opnum);
            previous_failed = previous.permafail;
        }
        if previous_failed {
            self.fail_permanently();
            return;
        }
        if self.previous.as_ref().map(LogSegment::all_synced) == Some(true) {
            self.previous = None;
        }
        self.current.maybe_sync(&self.syncer, opnum);
        if self.current.permafail {
            self.fail_permanently();
        }
    }

    fn get_writable_log(&mut self) -> Option<&mut LogSegment> {
        if self.permafail || self.current.permafail {
            return None;
        }
        if self.current.written >= SEGMENT_ROTATE_BYTES && self.previous.is_none() {
            ROTATE.click();
            match LogSegment::open(&self.root, self.current.lognum + 1) {
                Ok(next) => {
                    clue!(COLLECTOR, INFO, {
                        acceptor_rotate: next.lognum,
                    });
                    self.previous = Some(std::mem::replace(&mut self.current, next));
                }
                Err(_) => {
                    return None;
                }
            }
        }
        Some(&mut self.current)
    }

    fn atomic_write(&mut self, path: &Path, contents: &[u8]) -> Result<(), Error> {
        let tmp = ATOMIC_TMP(&self.root);
        let mut f = File::create(&tmp)?;
        f.write_all(contents)?;
        f.sync_all()?;
        self.dir.sync_all()?;
        rename(&tmp, path)?;
        self.dir.sync_all()?;
        Ok(())
    }

    fn parse_identity(ident: &str) -> Result<(Server, Bootstrap), Error> {
        let mut lines = ident.lines();
        let server = lines
            .next()
            .ok_or_else(|| Error::corruption("empty identity"))?;
        let server: Server = server.parse()?;
        let bootstrap = lines
            .next()
            .ok_or_else(|| Error::corruption("identity missing bootstrap"))?;
        let bootstrap = Bootstrap::parse(bootstrap)?;
        Ok((server, bootstrap))
    }
}

/////////////////////////////////////////////// dump ///////////////////////////////////////////////

/// One record of a log segment, as read back by [dump_log].
#[derive(Clone, Debug, Eq, PartialEq)]
pub enum LogRecord {
    Adopted(Ballot),
    Accepted(PValue),
    GarbageCollected(u64),
}

/// Read every record of one log segment.  For debugging.
pub fn dump_log<P: AsRef<Path>>(path: P) -> Result<Vec<LogRecord>, Error> {
    let mut contents = Vec::new();
    File::open(path.as_ref())?.read_to_end(&mut contents)?;
    let mut records = Vec::new();
    let mut buf = &contents[..];
    while !buf.is_empty() {
        let tag = buf[0];
        buf = &buf[1..];
        match tag {
            RECORD_ADOPT => {
                let (b, rem) = Ballot::unpack_fixed(buf)?;
                records.push(LogRecord::Adopted(b));
                buf = rem;
            }
            RECORD_ACCEPT => {
                let (p, rem) = PValue::unpack_fixed(buf)?;
                records.push(LogRecord::Accepted(p));
                buf = rem;
            }
            RECORD_GC => {
                if buf.len() < 8 {
                    return Err(Error::corruption("truncated gc record"));
                }
                records.push(LogRecord::GarbageCollected(u64::from_be_bytes(
                    buf[..8].try_into().unwrap(),
                )));
                buf = &buf[8..];
            }
            _ => {
                return Err(Error::corruption(format!("unknown record type {}", tag)));
            }
        }
    }
    Ok(records)
}

/////////////////////////////////////////////// tests //////////////////////////////////////////////

#[cfg(test)]
mod tests {
    use replicant_pb::ServerId;

    use crate::test_root;

    use super::*;

    fn ballot(number: u64, leader: u64) -> Ballot {
        Ballot::new(number, ServerId::new(leader))
    }

    fn wait_for_sync(acc: &mut Acceptor, cut: u64) {
        for _ in 0..1000 {
            if acc.sync_cut() >= cut {
                return;
            }
            std::thread::sleep(std::time::Duration::from_millis(1));
        }
        panic!("sync_cut never reached {}", cut);
    }

    #[test]
    fn fresh_directory_has_no_identity() {
        let root = test_root(module_path!(), line!());
        let (acc, saved) = Acceptor::open(&root).unwrap();
        assert!(saved.is_none());
        assert_eq!(Ballot::BOTTOM, acc.current_ballot());
        assert_eq!(0, acc.lowest_acceptable_slot());
        assert!(root.join("log.0").exists());
    }

    #[test]
    fn cannot_open_twice() {
        let root = test_root(module_path!(), line!());
        let (_acc, _) = Acceptor::open(&root).unwrap();
        if let Err(Error::LockNotObtained { .. }) = Acceptor::open(&root) {
        } else {
            panic!("second open should fail to take the lock");
        }
    }

    #[test]
    fn replay_after_restart() {
        let root = test_root(module_path!(), line!());
        {
            let (mut acc, _) = Acceptor::open(&root).unwrap();
            acc.adopt(ballot(1, 7));
            acc.accept(PValue::new(ballot(1, 7), 0, b"zero".to_vec()));
            acc.accept(PValue::new(ballot(1, 7), 1, b"one".to_vec()));
            let cut = acc.write_cut();
            acc.save(
                &Server::new(ServerId::new(7), "h:1982"),
                &Bootstrap::parse("h:1982").unwrap(),
            )
            .unwrap();
            wait_for_sync(&mut acc, cut);
        }
        let (mut acc, saved) = Acceptor::open(&root).unwrap();
        let (us, bootstrap) = saved.expect("identity should have been saved");
        assert_eq!(ServerId::new(7), us.id);
        assert_eq!("h:1982", bootstrap.conn_str());
        assert_eq!(ballot(1, 7), acc.current_ballot());
        let pvals = acc.pvals().to_vec();
        assert_eq!(2, pvals.len());
        assert_eq!(b"zero".to_vec(), pvals[0].command);
        assert_eq!(b"one".to_vec(), pvals[1].command);
        assert!(root.join("log.1").exists());
    }

    #[test]
    fn compaction_keeps_highest_ballot() {
        let root = test_root(module_path!(), line!());
        let (mut acc, _) = Acceptor::open(&root).unwrap();
        acc.adopt(ballot(1, 3));
        acc.accept(PValue::new(ballot(1, 3), 5, b"old".to_vec()));
        acc.adopt(ballot(2, 4));
        acc.accept(PValue::new(ballot(2, 4), 5, b"new".to_vec()));
        acc.accept(PValue::new(ballot(2, 4), 6, b"six".to_vec()));
        let pvals = acc.pvals().to_vec();
        assert_eq!(2, pvals.len());
        assert_eq!(5, pvals[0].slot);
        assert_eq!(b"new".to_vec(), pvals[0].command);
        assert_eq!(6, pvals[1].slot);
    }

    #[test]
    fn garbage_collect_raises_floor() {
        let root = test_root(module_path!(), line!());
        let (mut acc, _) = Acceptor::open(&root).unwrap();
        acc.adopt(ballot(1, 3));
        for slot in 0..10 {
            acc.accept(PValue::new(ballot(1, 3), slot, b"x".to_vec()));
        }
        acc.garbage_collect(5);
        assert_eq!(5, acc.lowest_acceptable_slot());
        assert!(acc.pvals().iter().all(|p| p.slot >= 5));
        // The floor never goes back down.
        acc.garbage_collect(3);
        assert_eq!(5, acc.lowest_acceptable_slot());
    }

    #[test]
    fn gc_floor_survives_restart() {
        let root = test_root(module_path!(), line!());
        {
            let (mut acc, _) = Acceptor::open(&root).unwrap();
            acc.adopt(ballot(1, 3));
            acc.accept(PValue::new(ballot(1, 3), 0, b"x".to_vec()));
            acc.garbage_collect(7);
            acc.save(
                &Server::new(ServerId::new(3), "h:1982"),
                &Bootstrap::parse("h:1982").unwrap(),
            )
            .unwrap();
            let cut = acc.write_cut();
            wait_for_sync(&mut acc, cut);
        }
        let (acc, _) = Acceptor::open(&root).unwrap();
        assert_eq!(7, acc.lowest_acceptable_slot());
    }

    #[test]
    fn sync_cut_advances_past_writes() {
        let root = test_root(module_path!(), line!());
        let (mut acc, _) = Acceptor::open(&root).unwrap();
        acc.adopt(ballot(1, 1));
        acc.accept(PValue::new(ballot(1, 1), 0, b"cmd".to_vec()));
        let cut = acc.write_cut();
        assert!(cut >= 2);
        wait_for_sync(&mut acc, cut);
        assert!(!acc.failed());
    }

    #[test]
    fn snapshots_round_trip() {
        let root = test_root(module_path!(), line!());
        let (mut acc, _) = Acceptor::open(&root).unwrap();
        assert_eq!(None, acc.load_latest_snapshot().unwrap());
        acc.record_snapshot(10, b"ten").unwrap();
        acc.record_snapshot(20, b"twenty").unwrap();
        let (slot, snap) = acc.load_latest_snapshot().unwrap().unwrap();
        assert_eq!(20, slot);
        assert_eq!(b"twenty".to_vec(), snap);
    }

    #[test]
    fn identity_without_state_is_fatal() {
        let root = test_root(module_path!(), line!());
        std::fs::create_dir(&root).unwrap();
        std::fs::write(
            IDENTITY(&root),
            "server(id=1, bind_to=h:1982)\nh:1982\n",
        )
        .unwrap();
        if let Err(Error::Corruption { .. }) = Acceptor::open(&root) {
        } else {
            panic!("identity without state should be fatal");
        }
    }

    #[test]
    fn state_without_identity_is_fatal() {
        let root = test_root(module_path!(), line!());
        {
            let (mut acc, _) = Acceptor::open(&root).unwrap();
            acc.adopt(ballot(1, 1));
            let cut = acc.write_cut();
            wait_for_sync(&mut acc, cut);
        }
        if let Err(Error::Corruption { .. }) = Acceptor::open(&root) {
        } else {
            panic!("state without identity should be fatal");
        }
    }

    #[test]
    fn replay_a_large_random_log() {
        let root = test_root(module_path!(), line!());
        let mut guac = guacamole::Guacamole::new(0x1eaf);
        let mut expected = Vec::new();
        {
            let (mut acc, _) = Acceptor::open(&root).unwrap();
            acc.adopt(ballot(1, 1));
            for slot in 0..1000 {
                let mut sz = [0u8; 2];
                guac.generate(&mut sz);
                let mut command = vec![0u8; (u16::from_le_bytes(sz) % 512) as usize];
                guac.generate(&mut command);
                let p = PValue::new(ballot(1, 1), slot, command);
                expected.push(p.clone());
                acc.accept(p);
            }
            acc.save(
                &Server::new(ServerId::new(1), "h:1982"),
                &Bootstrap::parse("h:1982").unwrap(),
            )
            .unwrap();
            let cut = acc.write_cut();
            wait_for_sync(&mut acc, cut);
        }
        let (mut acc, _) = Acceptor::open(&root).unwrap();
        assert_eq!(ballot(1, 1), acc.current_ballot());
        assert_eq!(expected, acc.pvals().to_vec());
    }

    #[test]
    fn dump_reads_back_records() {
        let root = test_root(module_path!(), line!());
        let (mut acc, _) = Acceptor::open(&root).unwrap();
        acc.adopt(ballot(1, 9));
        acc.accept(PValue::new(ballot(1, 9), 3, b"cmd".to_vec()));
        acc.garbage_collect(2);
        let cut = acc.write_cut();
        wait_for_sync(&mut acc, cut);
        let records = dump_log(root.join("log.0")).unwrap();
        assert_eq!(
            vec![
                LogRecord::Adopted(ballot(1, 9)),
                LogRecord::Accepted(PValue::new(ballot(1, 9), 3, b"cmd".to_vec())),
                LogRecord::GarbageCollected(2),
            ],
            records
        );
    }
}
