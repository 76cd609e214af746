// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Inspects and edits a record store kept in a flash image file.
//!
//! The image is a plain file of `pages * words_per_page * 4` bytes. Writes
//! are applied NOR-style (bits only ever cleared) so that images behave like
//! the real thing.

use std::cell::RefCell;
use std::fs::File;
use std::io::{Read, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};
use std::rc::Rc;

use anyhow::{anyhow, bail, Context};
use clap::Parser;
use rustyline::error::ReadlineError;

use flashrec::low_level::{self, Geometry, PageType, Slot};
use flashrec::{
    Config, Event, Flash, FlashEvent, FlashOp, FindToken, RecordDesc, Store,
};

#[derive(Parser)]
struct Fdstool {
    /// Words per physical flash page.
    #[clap(short, long, default_value_t = 256)]
    words_per_page: u32,

    /// Physical pages per virtual page.
    #[clap(short = 'v', long, default_value_t = 1)]
    pages_per_virtual: u32,

    image_file: PathBuf,

    #[clap(subcommand)]
    cmd: Cmd,
}

#[derive(Parser)]
enum Cmd {
    /// Creates an erased image of `pages` physical pages.
    Create { pages: u32 },
    /// Erases and lays out the store.
    Format,
    Write {
        file_id: u16,
        record_key: u16,
        value: String,
    },
    Update {
        record_id: u32,
        file_id: u16,
        record_key: u16,
        value: String,
    },
    Read {
        file_id: u16,
        record_key: u16,
    },
    Delete { record_id: u32 },
    DeleteFile { file_id: u16 },
    Gc {
        /// Stop after copying this many records.
        #[clap(long)]
        bound: Option<u32>,
    },
    /// Lists every valid record.
    List,
    Stat,
    /// Prints every page and record, including dirty ones.
    Dump,
    /// Mounts once and reads commands interactively.
    Shell,
}

/// One shell line, parsed like the command line minus the global options.
#[derive(Parser)]
#[clap(no_binary_name = true)]
struct ShellLine {
    #[clap(subcommand)]
    cmd: Cmd,
}

fn main() -> Result<(), anyhow::Error> {
    env_logger::init();
    let args = Fdstool::parse();

    if let Cmd::Create { pages } = args.cmd {
        FlashImage::create(&args.image_file, args.words_per_page, pages)?;
        println!("created {} pages of {} words", pages, args.words_per_page);
        return Ok(());
    }

    let img = FlashImage::open(&args.image_file, args.words_per_page)
        .with_context(|| format!("opening image file {}", args.image_file.display()))?;
    let config = Config::default().with_pages_per_virtual(args.pages_per_virtual);
    let mut tool = Tool::new(img, config)?;

    if let Cmd::Format = args.cmd {
        return tool.format();
    }
    tool.mount()?;
    match args.cmd {
        Cmd::Shell => shell(&mut tool),
        cmd => tool.run(cmd),
    }
}

fn shell(tool: &mut Tool) -> Result<(), anyhow::Error> {
    let mut rl = rustyline::Editor::<()>::new()?;

    loop {
        match rl.readline("fds> ") {
            Ok(line) => {
                if line.trim().is_empty() {
                    continue;
                }
                rl.add_history_entry(line.as_str());
                match ShellLine::try_parse_from(line.split_whitespace()) {
                    Ok(ShellLine { cmd: Cmd::Shell | Cmd::Create { .. } }) => {
                        println!("not available here");
                    }
                    Ok(ShellLine { cmd: Cmd::Format }) => report(tool.format()),
                    Ok(ShellLine { cmd }) => report(tool.run(cmd)),
                    Err(e) => println!("{e}"),
                }
            }
            Err(ReadlineError::Eof) => {
                println!("exiting.");
                break;
            }
            Err(ReadlineError::Interrupted) => {
                println!("^C");
            }
            Err(ReadlineError::Io(e)) => return Err(e.into()),
            Err(e) => {
                println!("unexpected error: {e:?}");
                break;
            }
        }
    }

    Ok(())
}

fn report(r: Result<(), anyhow::Error>) {
    if let Err(e) = r {
        println!("error: {e:#}");
    }
}

/// The store plus the events it has produced and nobody has printed yet.
struct Tool {
    store: Store<FlashImage>,
    events: Rc<RefCell<Vec<Event>>>,
}

impl Tool {
    fn new(img: FlashImage, config: Config) -> Result<Self, anyhow::Error> {
        let mut store = Store::new(img, config)
            .map_err(|e| anyhow!("bad geometry: {e}"))?;
        let events = Rc::new(RefCell::new(Vec::new()));
        let sink = events.clone();
        store.subscribe(move |e: &Event| sink.borrow_mut().push(*e))
            .map_err(|e| anyhow!("{e}"))?;
        Ok(Self { store, events })
    }

    /// Completes flash operations until the store goes quiet, then prints
    /// the events that came out. Fails if any of them reports an error.
    fn settle(&mut self) -> Result<(), anyhow::Error> {
        while let Some(done) = self.store.flash_mut().complete()? {
            self.store.on_flash_event(done);
        }
        let mut failed = None;
        for e in self.events.borrow_mut().drain(..) {
            match e.result {
                Ok(()) => println!(
                    "{:?}: ok (file {:#x} key {:#x} record {})",
                    e.kind, e.file_id, e.record_key, e.record_id,
                ),
                Err(err) => {
                    println!("{:?}: {}", e.kind, err);
                    failed = Some(err);
                }
            }
        }
        match failed {
            Some(err) => Err(anyhow!("{err}")),
            None => Ok(()),
        }
    }

    fn mount(&mut self) -> Result<(), anyhow::Error> {
        self.store.init().map_err(|e| anyhow!("init: {e}"))?;
        self.settle().context("could not mount")
    }

    fn format(&mut self) -> Result<(), anyhow::Error> {
        self.store.format().map_err(|e| anyhow!("format: {e}"))?;
        self.settle()
    }

    fn descriptor(&self, record_id: u32) -> Result<RecordDesc, anyhow::Error> {
        self.store.descriptor_from_record_id(record_id)
            .map_err(|e| anyhow!("record {record_id}: {e}"))
    }

    fn run(&mut self, cmd: Cmd) -> Result<(), anyhow::Error> {
        match cmd {
            Cmd::Create { .. } | Cmd::Format | Cmd::Shell => bail!("not a store command"),
            Cmd::Write { file_id, record_key, value } => {
                let desc = self.store.write(file_id, record_key, value.as_bytes())
                    .map_err(|e| anyhow!("write: {e}"))?;
                println!("queued record {}", desc.record_id());
            }
            Cmd::Update { record_id, file_id, record_key, value } => {
                let old = self.descriptor(record_id)?;
                let desc = self.store.update(&old, file_id, record_key, value.as_bytes())
                    .map_err(|e| anyhow!("update: {e}"))?;
                println!("queued record {}", desc.record_id());
            }
            Cmd::Read { file_id, record_key } => {
                let mut token = FindToken::new();
                let mut found = false;
                while let Some(desc) = self.store.find_record(file_id, record_key, &mut token)
                    .map_err(|e| anyhow!("find: {e}"))?
                {
                    found = true;
                    match self.store.open(&desc) {
                        Ok(rec) => {
                            println!("record {}", desc.record_id());
                            println!("{}", pretty_hex::pretty_hex(&rec.data()));
                        }
                        Err(e) => println!("record {}: {}", desc.record_id(), e),
                    }
                }
                if !found {
                    println!("not found");
                }
            }
            Cmd::Delete { record_id } => {
                let desc = self.descriptor(record_id)?;
                self.store.delete_record(&desc).map_err(|e| anyhow!("delete: {e}"))?;
            }
            Cmd::DeleteFile { file_id } => {
                self.store.delete_file(file_id).map_err(|e| anyhow!("delete file: {e}"))?;
            }
            Cmd::Gc { bound } => {
                let r = match bound {
                    Some(n) => self.store.gc_bounded(n),
                    None => self.store.gc(),
                };
                r.map_err(|e| anyhow!("gc: {e}"))?;
            }
            Cmd::List => {
                let mut token = FindToken::new();
                while let Some(desc) = self.store.iterate(&mut token)
                    .map_err(|e| anyhow!("iterate: {e}"))?
                {
                    match self.store.open(&desc) {
                        Ok(rec) => {
                            let info = rec.info();
                            println!(
                                "record {:6}  file {:#06x}  key {:#06x}  {} words",
                                info.record_id, info.file_id, info.record_key, info.length_words,
                            );
                        }
                        Err(e) => println!("record {:6}  {}", desc.record_id(), e),
                    }
                }
            }
            Cmd::Stat => {
                let stat = self.store.stat();
                println!("data pages:      {}", stat.pages_available);
                println!("page size:       {} words", self.store.page_size_words());
                println!("valid records:   {}", stat.valid_records);
                println!("dirty records:   {}", stat.dirty_records);
                println!("words used:      {}", stat.words_used);
                println!("words free:      {}", self.store.free_words());
                println!("words freeable:  {}", stat.freeable_words);
                println!("largest record:  {} words", stat.largest_contig);
                if stat.corruption {
                    println!("CORRUPTION DETECTED");
                }
            }
            Cmd::Dump => dump(self.store.flash(), self.store.geometry())?,
        }
        self.settle()
    }
}

fn dump(img: &FlashImage, geo: &Geometry) -> Result<(), anyhow::Error> {
    let mut payload = Vec::new();
    for page in 0..geo.virtual_pages() {
        let info = low_level::read_page_info(img, geo, page)
            .map_err(|e| anyhow!("page {page}: {e:?}"))?;
        println!("page {page}: {:?}, id floor {}", info.page_type, info.id_floor);
        if !matches!(info.page_type, PageType::Data | PageType::Swap) {
            continue;
        }

        let mut offset = low_level::PageTag::WORDS;
        loop {
            let slot = match low_level::next_record(img, geo, page, offset)
                .map_err(|e| anyhow!("page {page} offset {offset}: {e:?}"))?
            {
                Slot::Record(slot) => slot,
                Slot::End => break,
                Slot::Torn => {
                    println!("- torn header at offset {offset}");
                    break;
                }
            };
            let h = &slot.header;
            low_level::read_payload(img, geo, page, &slot, &mut payload)
                .map_err(|e| anyhow!("page {page} offset {offset}: {e:?}"))?;
            println!(
                "- offset {}: record {} file {:#06x} key {:#06x} {:?}, CRC {}",
                slot.offset,
                h.record_id.get(),
                h.file_id.get(),
                h.record_key.get(),
                h.state(),
                if h.crc_valid(&payload) { "ok" } else { "BAD" },
            );
            if !payload.is_empty() {
                println!("{}", pretty_hex::pretty_hex(&payload));
            }
            offset = slot.next;
        }
        println!();
    }
    Ok(())
}

enum Pending {
    Write { byte_offset: u64, data: Vec<u8> },
    Erase { page: u32 },
}

/// A flash device backed by an image file. Operations are carried out when
/// `complete` is called.
struct FlashImage {
    file: RefCell<File>,
    words_per_page: u32,
    pages: u32,
    pending: Option<Pending>,
}

impl FlashImage {
    fn create(path: &Path, words_per_page: u32, pages: u32) -> Result<(), anyhow::Error> {
        let mut file = std::fs::OpenOptions::new()
            .write(true)
            .create_new(true)
            .open(path)
            .with_context(|| format!("creating {}", path.display()))?;
        let erased = vec![0xFF; low_level::words_to_bytes(words_per_page)];
        for _ in 0..pages {
            file.write_all(&erased)?;
        }
        Ok(())
    }

    fn open(path: &Path, words_per_page: u32) -> Result<Self, anyhow::Error> {
        let file = std::fs::OpenOptions::new()
            .read(true)
            .write(true)
            .create(false)
            .open(path)?;
        let file_len = file.metadata()?.len();
        let page_bytes = low_level::words_to_bytes(words_per_page) as u64;

        if page_bytes == 0 || file_len % page_bytes != 0 {
            bail!("file is not a whole number of pages in length");
        }
        let pages = u32::try_from(file_len / page_bytes).context("file too large")?;

        Ok(Self {
            file: file.into(),
            words_per_page,
            pages,
            pending: None,
        })
    }

    fn byte_offset(&self, page: u32, offset: u32, len: usize) -> std::io::Result<u64> {
        let start = low_level::words_to_bytes(page * self.words_per_page + offset) as u64;
        let end = low_level::words_to_bytes(self.pages * self.words_per_page) as u64;
        if page >= self.pages || start + len as u64 > end {
            return Err(std::io::Error::new(
                std::io::ErrorKind::InvalidInput,
                format!("access past end of image: page {page} offset {offset}"),
            ));
        }
        Ok(start)
    }

    fn start(&mut self, pending: Pending) -> std::io::Result<()> {
        if self.pending.is_some() {
            return Err(std::io::Error::new(
                std::io::ErrorKind::WouldBlock,
                "flash operation already in progress",
            ));
        }
        self.pending = Some(pending);
        Ok(())
    }

    /// Carries out the pending operation, if any.
    fn complete(&mut self) -> std::io::Result<Option<FlashEvent>> {
        let Some(pending) = self.pending.take() else {
            return Ok(None);
        };
        let mut file = self.file.borrow_mut();
        match pending {
            Pending::Write { byte_offset, data } => {
                let mut cells = vec![0; data.len()];
                file.seek(SeekFrom::Start(byte_offset))?;
                file.read_exact(&mut cells)?;
                for (cell, new) in cells.iter_mut().zip(&data) {
                    *cell &= new;
                }
                file.seek(SeekFrom::Start(byte_offset))?;
                file.write_all(&cells)?;
                Ok(Some(FlashEvent::success(FlashOp::Write)))
            }
            Pending::Erase { page } => {
                let page_bytes = low_level::words_to_bytes(self.words_per_page);
                file.seek(SeekFrom::Start((page as u64) * page_bytes as u64))?;
                file.write_all(&vec![0xFF; page_bytes])?;
                Ok(Some(FlashEvent::success(FlashOp::Erase)))
            }
        }
    }
}

impl Flash for FlashImage {
    type Error = std::io::Error;

    fn words_per_page(&self) -> u32 {
        self.words_per_page
    }

    fn page_count(&self) -> u32 {
        self.pages
    }

    fn read(&self, page: u32, offset: u32, dest: &mut [u8]) -> Result<(), Self::Error> {
        let start = self.byte_offset(page, offset, dest.len())?;
        let mut file = self.file.borrow_mut();
        file.seek(SeekFrom::Start(start))?;
        file.read_exact(dest)
    }

    fn begin_write(&mut self, page: u32, offset: u32, data: &[u8]) -> Result<(), Self::Error> {
        let byte_offset = self.byte_offset(page, offset, data.len())?;
        self.start(Pending::Write { byte_offset, data: data.to_vec() })
    }

    fn begin_erase(&mut self, page: u32) -> Result<(), Self::Error> {
        self.byte_offset(page, 0, 0)?;
        self.start(Pending::Erase { page })
    }
}
