use std::thread;

use fileblock::MemoryDisk;
use simplefs::fs::BLOCK_SECTORS;
use simplefs::ipc::{mailbox, Client, ClientId, Message, Reply};
use simplefs::protocol::*;
use simplefs::{SFSError, Server, ServerConfig, SFS};

fn server(nblocks: u32, config: ServerConfig) -> Server<MemoryDisk> {
  let _ = env_logger::builder().is_test(true).try_init();
  let dev = MemoryDisk::new(u64::from(nblocks) * BLOCK_SECTORS as u64);
  Server::new(SFS::format(dev, nblocks).unwrap(), config)
}

fn page_with<V: zerocopy::AsBytes>(req: &V) -> Box<Page> {
  let mut page = new_page();
  encode(req, &mut page);
  page
}

fn request(srv: &mut Server<MemoryDisk>, from: ClientId, opcode: Opcode, page: Box<Page>) -> Reply {
  let msg = Message {
    from,
    opcode: opcode.into(),
    page: Some(page),
    perm: Perm::request(),
  };
  srv.handle(msg).unwrap().expect("request got no reply")
}

fn check(reply: &Reply) -> Result<i32, ErrorCode> {
  match ErrorCode::from_code(reply.value) {
    Some(code) => Err(code),
    None => Ok(reply.value),
  }
}

fn open(srv: &mut Server<MemoryDisk>, from: ClientId, path: &str, mode: OpenMode) -> Result<u32, ErrorCode> {
  let reply = request(srv, from, Opcode::Open, page_with(&OpenReq::new(path, mode)));
  check(&reply)?;
  assert_eq!(reply.perm, Perm::descriptor());
  let desc: Descriptor = decode(&reply.page.unwrap()).unwrap();
  assert_eq!(desc.omode.get(), mode.access().bits());
  Ok(desc.file_id.get())
}

fn write(srv: &mut Server<MemoryDisk>, from: ClientId, id: u32, data: &[u8]) -> Result<i32, ErrorCode> {
  check(&request(srv, from, Opcode::Write, page_with(&WriteReq::new(id, data))))
}

fn read(srv: &mut Server<MemoryDisk>, from: ClientId, id: u32, n: u32) -> Result<Vec<u8>, ErrorCode> {
  let reply = request(srv, from, Opcode::Read, page_with(&ReadReq::new(id, n)));
  let count = check(&reply)? as usize;
  Ok(reply.page.unwrap()[..count].to_vec())
}

fn simple(srv: &mut Server<MemoryDisk>, from: ClientId, opcode: Opcode, id: u32) -> Result<i32, ErrorCode> {
  check(&request(srv, from, opcode, page_with(&FileReq::new(id))))
}

fn remove(srv: &mut Server<MemoryDisk>, from: ClientId, path: &str) -> Result<i32, ErrorCode> {
  check(&request(srv, from, Opcode::Remove, page_with(&RemoveReq::new(path))))
}

fn stat(srv: &mut Server<MemoryDisk>, from: ClientId, id: u32) -> simplefs::Stat {
  let reply = request(srv, from, Opcode::Stat, page_with(&FileReq::new(id)));
  check(&reply).unwrap();
  let ret: StatRet = decode(&reply.page.unwrap()).unwrap();
  ret.to_stat().unwrap()
}

#[test]
fn open_create_and_exclusive_create() {
  let mut srv = server(64, ServerConfig::default());
  assert_eq!(open(&mut srv, 1, "/missing", OpenMode::RDONLY), Err(ErrorCode::NotFound));

  let id = open(&mut srv, 1, "/missing", OpenMode::RDWR | OpenMode::CREAT).unwrap();
  assert_eq!(
    open(&mut srv, 1, "/missing", OpenMode::RDWR | OpenMode::CREAT | OpenMode::EXCL),
    Err(ErrorCode::FileExists)
  );
  // Without EXCL an existing file is simply opened.
  let again = open(&mut srv, 1, "/missing", OpenMode::RDONLY | OpenMode::CREAT).unwrap();
  assert_ne!(id, again);
  assert_eq!(srv.table().open_count(), 2);
}

#[test]
fn bad_paths_are_reported() {
  let mut srv = server(64, ServerConfig::default());
  assert_eq!(open(&mut srv, 1, "relative", OpenMode::RDONLY), Err(ErrorCode::BadPath));
  let long = format!("/{}", "n".repeat(200));
  assert_eq!(open(&mut srv, 1, &long, OpenMode::CREAT), Err(ErrorCode::BadPath));
}

#[test]
fn read_and_write_follow_the_descriptor_offset() {
  let mut srv = server(64, ServerConfig::default());
  let id = open(&mut srv, 1, "/log", OpenMode::RDWR | OpenMode::CREAT).unwrap();
  assert_eq!(write(&mut srv, 1, id, b"hello "), Ok(6));
  assert_eq!(write(&mut srv, 1, id, b"world"), Ok(5));
  assert_eq!(stat(&mut srv, 1, id).size, 11);

  // Reading continues at the end of what was written.
  assert_eq!(read(&mut srv, 1, id, 100).unwrap(), b"");
  let seek = page_with(&SeekReq::new(id, 6));
  check(&request(&mut srv, 1, Opcode::Seek, seek)).unwrap();
  assert_eq!(read(&mut srv, 1, id, 3).unwrap(), b"wor");
  assert_eq!(read(&mut srv, 1, id, 100).unwrap(), b"ld");
}

#[test]
fn reads_are_capped_at_one_page() {
  let mut srv = server(64, ServerConfig::default());
  let id = open(&mut srv, 1, "/big", OpenMode::RDWR | OpenMode::CREAT).unwrap();
  let chunk = vec![9u8; WRITE_BUF_SIZE];
  assert_eq!(write(&mut srv, 1, id, &chunk), Ok(WRITE_BUF_SIZE as i32));
  assert_eq!(write(&mut srv, 1, id, &chunk), Ok(WRITE_BUF_SIZE as i32));

  check(&request(&mut srv, 1, Opcode::Seek, page_with(&SeekReq::new(id, 0)))).unwrap();
  assert_eq!(read(&mut srv, 1, id, 1 << 20).unwrap().len(), PAGE_SIZE);
}

#[test]
fn access_mode_is_enforced() {
  let mut srv = server(64, ServerConfig::default());
  let w = open(&mut srv, 1, "/f", OpenMode::WRONLY | OpenMode::CREAT).unwrap();
  assert_eq!(read(&mut srv, 1, w, 10), Err(ErrorCode::Inval));
  write(&mut srv, 1, w, b"abc").unwrap();

  let r = open(&mut srv, 1, "/f", OpenMode::RDONLY).unwrap();
  assert_eq!(write(&mut srv, 1, r, b"x"), Err(ErrorCode::Inval));
  let set_size = page_with(&SetSizeReq::new(r, 0));
  assert_eq!(check(&request(&mut srv, 1, Opcode::SetSize, set_size)), Err(ErrorCode::Inval));
  assert_eq!(read(&mut srv, 1, r, 10).unwrap(), b"abc");
}

#[test]
fn directories_cannot_be_opened_for_writing() {
  let mut srv = server(64, ServerConfig::default());
  open(&mut srv, 1, "/dir", OpenMode::MKDIR | OpenMode::RDONLY).unwrap();
  assert_eq!(open(&mut srv, 1, "/dir", OpenMode::RDWR), Err(ErrorCode::Inval));
  assert_eq!(open(&mut srv, 1, "/dir", OpenMode::TRUNC), Err(ErrorCode::Inval));

  let id = open(&mut srv, 1, "/dir", OpenMode::RDONLY).unwrap();
  assert!(stat(&mut srv, 1, id).is_dir);
}

#[test]
fn truncating_open_empties_the_file() {
  let mut srv = server(64, ServerConfig::default());
  let id = open(&mut srv, 1, "/f", OpenMode::WRONLY | OpenMode::CREAT).unwrap();
  write(&mut srv, 1, id, &[1; 5000]).unwrap();
  simple(&mut srv, 1, Opcode::Close, id).unwrap();

  let id = open(&mut srv, 1, "/f", OpenMode::RDWR | OpenMode::TRUNC).unwrap();
  assert_eq!(stat(&mut srv, 1, id).size, 0);
}

#[test]
fn busy_files_cannot_be_removed() {
  let mut srv = server(64, ServerConfig::default());
  let a = open(&mut srv, 1, "/shared", OpenMode::RDWR | OpenMode::CREAT).unwrap();
  let b = open(&mut srv, 2, "/shared", OpenMode::RDONLY).unwrap();

  assert_eq!(remove(&mut srv, 1, "/shared"), Err(ErrorCode::Busy));
  simple(&mut srv, 1, Opcode::Close, a).unwrap();
  assert_eq!(remove(&mut srv, 1, "/shared"), Err(ErrorCode::Busy));
  simple(&mut srv, 2, Opcode::Close, b).unwrap();
  assert_eq!(remove(&mut srv, 1, "/shared"), Ok(0));
  assert_eq!(open(&mut srv, 1, "/shared", OpenMode::RDONLY), Err(ErrorCode::NotFound));
}

#[test]
fn open_descendants_keep_a_directory_busy() {
  let mut srv = server(64, ServerConfig::default());
  let d = open(&mut srv, 1, "/d", OpenMode::MKDIR).unwrap();
  let e = open(&mut srv, 1, "/d/e", OpenMode::MKDIR).unwrap();
  let f = open(&mut srv, 1, "/d/e/f", OpenMode::CREAT | OpenMode::WRONLY).unwrap();
  simple(&mut srv, 1, Opcode::Close, d).unwrap();
  simple(&mut srv, 1, Opcode::Close, e).unwrap();

  assert_eq!(remove(&mut srv, 1, "/d"), Err(ErrorCode::Busy));
  simple(&mut srv, 1, Opcode::Close, f).unwrap();
  assert_eq!(remove(&mut srv, 1, "/d"), Ok(0));
  assert_eq!(open(&mut srv, 1, "/d/e/f", OpenMode::RDONLY), Err(ErrorCode::NotFound));
  assert_eq!(remove(&mut srv, 1, "/"), Err(ErrorCode::Inval));
}

#[test]
fn handles_belong_to_their_holders() {
  let mut srv = server(64, ServerConfig::default());
  let id = open(&mut srv, 1, "/f", OpenMode::RDWR | OpenMode::CREAT).unwrap();
  assert_eq!(simple(&mut srv, 2, Opcode::Stat, id), Err(ErrorCode::Inval));

  let share = page_with(&ShareReq::new(id, 2));
  check(&request(&mut srv, 1, Opcode::Share, share)).unwrap();
  write(&mut srv, 2, id, b"inherited").unwrap();

  simple(&mut srv, 1, Opcode::Close, id).unwrap();
  // Still open through the second holder.
  assert_eq!(stat(&mut srv, 2, id).size, 9);
  simple(&mut srv, 2, Opcode::Close, id).unwrap();
  assert_eq!(simple(&mut srv, 2, Opcode::Stat, id), Err(ErrorCode::Inval));
  assert_eq!(srv.table().open_count(), 0);
}

#[test]
fn handle_table_runs_out() {
  let mut srv = server(64, ServerConfig::default().with_max_open(2));
  assert_eq!(srv.table().capacity(), 2);
  let a = open(&mut srv, 1, "/a", OpenMode::CREAT).unwrap();
  open(&mut srv, 1, "/b", OpenMode::CREAT).unwrap();
  assert_eq!(open(&mut srv, 1, "/c", OpenMode::CREAT), Err(ErrorCode::MaxOpen));

  simple(&mut srv, 1, Opcode::Close, a).unwrap();
  let c = open(&mut srv, 1, "/c", OpenMode::CREAT).unwrap();
  assert_eq!(c % 2, a % 2);
  assert_ne!(c, a);
  // The stale id no longer names anything.
  assert_eq!(simple(&mut srv, 1, Opcode::Stat, a), Err(ErrorCode::Inval));
}

#[test]
fn full_disk_reports_no_space() {
  let mut srv = server(8, ServerConfig::default());
  let id = open(&mut srv, 1, "/f", OpenMode::WRONLY | OpenMode::CREAT).unwrap();
  for _ in 0..4 {
    write(&mut srv, 1, id, &[1; WRITE_BUF_SIZE]).unwrap();
  }
  assert_eq!(write(&mut srv, 1, id, &[1; WRITE_BUF_SIZE]), Err(ErrorCode::NoDisk));
}

#[test]
fn rename_moves_closed_files_only() {
  let mut srv = server(64, ServerConfig::default());
  let dst = open(&mut srv, 1, "/dst", OpenMode::MKDIR).unwrap();
  simple(&mut srv, 1, Opcode::Close, dst).unwrap();
  let id = open(&mut srv, 1, "/f", OpenMode::WRONLY | OpenMode::CREAT).unwrap();
  write(&mut srv, 1, id, b"payload").unwrap();

  let rename = || page_with(&RenameReq::new("/f", "/dst"));
  assert_eq!(check(&request(&mut srv, 1, Opcode::Rename, rename())), Err(ErrorCode::Busy));
  simple(&mut srv, 1, Opcode::Close, id).unwrap();
  assert_eq!(check(&request(&mut srv, 1, Opcode::Rename, rename())), Ok(0));

  assert_eq!(open(&mut srv, 1, "/f", OpenMode::RDONLY), Err(ErrorCode::NotFound));
  let id = open(&mut srv, 1, "/dst/f", OpenMode::RDONLY).unwrap();
  assert_eq!(read(&mut srv, 1, id, 100).unwrap(), b"payload");

  let into_self = page_with(&RenameReq::new("/dst", "/dst"));
  assert_eq!(check(&request(&mut srv, 1, Opcode::Rename, into_self)), Err(ErrorCode::Inval));
}

#[test]
fn flush_sync_and_info() {
  let mut srv = server(64, ServerConfig::default());
  let id = open(&mut srv, 1, "/f", OpenMode::WRONLY | OpenMode::CREAT).unwrap();
  write(&mut srv, 1, id, &[3; 100]).unwrap();
  assert_eq!(simple(&mut srv, 1, Opcode::Flush, id), Ok(0));
  assert!(srv.fs().cache().cached_blocks().iter().all(|&b| !srv.fs().cache().is_dirty(b)));

  assert_eq!(check(&request(&mut srv, 1, Opcode::Sync, new_page())), Ok(0));
  let reply = request(&mut srv, 1, Opcode::Info, new_page());
  check(&reply).unwrap();
  let info: InfoRet = decode(&reply.page.unwrap()).unwrap();
  assert_eq!(info.total_blocks.get(), 64);
  // Reserved blocks, the root directory block and one data block.
  assert_eq!(info.used_blocks.get(), 5);
}

#[test]
fn flush_releases_cache_once_the_last_handle_remains() {
  let mut srv = server(64, ServerConfig::default());
  let a = open(&mut srv, 1, "/f", OpenMode::RDWR | OpenMode::CREAT).unwrap();
  let b = open(&mut srv, 1, "/f", OpenMode::RDONLY).unwrap();
  write(&mut srv, 1, a, &[7; 100]).unwrap();
  let f = srv.fs_mut().open_file("/f").unwrap();
  let bno = srv.fs_mut().get_block(f, 0).unwrap();

  // Another handle still refers to the file.
  assert_eq!(simple(&mut srv, 1, Opcode::Flush, a), Ok(0));
  assert!(srv.fs().cache().is_cached(bno));
  assert!(!srv.fs().cache().is_dirty(bno));

  assert_eq!(simple(&mut srv, 1, Opcode::Close, b), Ok(0));
  assert!(srv.fs().cache().is_cached(bno));
  assert_eq!(simple(&mut srv, 1, Opcode::Flush, a), Ok(0));
  assert!(!srv.fs().cache().is_cached(bno));

  // Reading brings the block back; closing the last holder drops it again.
  check(&request(&mut srv, 1, Opcode::Seek, page_with(&SeekReq::new(a, 0)))).unwrap();
  assert_eq!(read(&mut srv, 1, a, 100).unwrap(), vec![7; 100]);
  assert!(srv.fs().cache().is_cached(bno));
  assert_eq!(simple(&mut srv, 1, Opcode::Close, a), Ok(0));
  assert!(!srv.fs().cache().is_cached(bno));

  let mut fs = srv.into_fs();
  assert_eq!(fs.cache().block_count(), Some(64));
  let mut buf = [0; 100];
  assert_eq!(fs.read(f, &mut buf, 0).unwrap(), 100);
  assert_eq!(buf, [7; 100]);
}

#[test]
fn malformed_requests_get_no_reply() {
  let mut srv = server(64, ServerConfig::default());
  let no_page = Message {
    from: 1,
    opcode: Opcode::Sync.into(),
    page: None,
    perm: Perm::empty(),
  };
  assert!(srv.handle(no_page).unwrap().is_none());

  let unknown = Message {
    from: 1,
    opcode: 99,
    page: Some(new_page()),
    perm: Perm::request(),
  };
  assert!(srv.handle(unknown).unwrap().is_none());

  // The server keeps serving.
  assert!(open(&mut srv, 1, "/still-alive", OpenMode::CREAT).is_ok());
}

#[test]
fn errors_hand_the_page_back() {
  let mut srv = server(64, ServerConfig::default());
  let reply = request(&mut srv, 1, Opcode::Stat, page_with(&FileReq::new(77)));
  assert!(reply.is_err());
  assert!(reply.page.is_some());
  assert_eq!(reply.perm, Perm::request());
}

fn call(client: &Client, opcode: Opcode, page: Box<Page>) -> Reply {
  client.call(opcode, Some(page), Perm::request()).unwrap()
}

#[test]
fn serves_clients_over_channels() {
  let srv = server(64, ServerConfig::default());
  let (mut transport, connector) = mailbox();
  let handle = thread::spawn(move || {
    let mut srv = srv;
    srv.serve(&mut transport).map(|_| srv)
  });

  let workers: Vec<_> = (0..3)
    .map(|i| {
      let client = connector.connect();
      thread::spawn(move || {
        let path = format!("/worker{}", i);
        let reply = call(&client, Opcode::Open, page_with(&OpenReq::new(&path, OpenMode::RDWR | OpenMode::CREAT)));
        assert_eq!(reply.value, 0);
        let desc: Descriptor = decode(&reply.page.unwrap()).unwrap();
        let id = desc.file_id.get();

        let reply = call(&client, Opcode::Write, page_with(&WriteReq::new(id, path.as_bytes())));
        assert_eq!(reply.value, path.len() as i32);
        let reply = call(&client, Opcode::Close, page_with(&FileReq::new(id)));
        assert_eq!(reply.value, 0);
      })
    })
    .collect();
  for worker in workers {
    worker.join().unwrap();
  }
  drop(connector);

  let mut srv = handle.join().unwrap().unwrap();
  assert_eq!(srv.table().open_count(), 0);
  for i in 0..3 {
    let f = srv.fs_mut().open_file(&format!("/worker{}", i)).unwrap();
    assert_eq!(srv.fs_mut().stat(f).unwrap().size, 8);
  }
}

#[test]
fn device_failure_stops_the_server() {
  let mut srv = server(64, ServerConfig::default());
  srv.fs_mut().cache_mut().device_mut().fail_writes(true);
  let (mut transport, connector) = mailbox();
  let handle = thread::spawn(move || srv.serve(&mut transport));

  let client = connector.connect();
  let err = client
    .call(Opcode::Open, Some(page_with(&OpenReq::new("/f", OpenMode::CREAT))), Perm::request())
    .unwrap_err();
  assert_eq!(err, simplefs::ipc::IpcError::Disconnected);
  assert!(matches!(handle.join().unwrap(), Err(SFSError::Device(_))));
}
