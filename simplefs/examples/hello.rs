//! Formats an in-memory volume, serves it on a thread and talks to it the way a
//! client process would.

use std::thread;

use fileblock::MemoryDisk;
use simplefs::fs::BLOCK_SECTORS;
use simplefs::ipc::{mailbox, Client, IpcError, Reply};
use simplefs::protocol::*;
use simplefs::{Server, ServerConfig, SFS};
use zerocopy::FromZeroes;

fn call<V: zerocopy::AsBytes>(client: &Client, opcode: Opcode, req: &V) -> Result<Reply, IpcError> {
    let mut page = new_page();
    encode(req, &mut page);
    client.call(opcode, Some(page), Perm::request())
}

pub fn main() {
    env_logger::init();

    let fs = SFS::format(MemoryDisk::new(256 * BLOCK_SECTORS as u64), 256).expect("format failed");
    let (mut transport, connector) = mailbox();
    let server = thread::spawn(move || Server::new(fs, ServerConfig::default()).serve(&mut transport));

    let client = connector.connect();
    drop(connector);

    let reply = call(&client, Opcode::Open, &OpenReq::new("/hello", OpenMode::RDWR | OpenMode::CREAT)).unwrap();
    let desc: Descriptor = decode(&reply.page.unwrap()).unwrap();
    let id = desc.file_id.get();
    println!("opened /hello as file {}", id);

    let reply = call(&client, Opcode::Write, &WriteReq::new(id, b"hello, world\n")).unwrap();
    println!("wrote {} bytes", reply.value);

    call(&client, Opcode::Seek, &SeekReq::new(id, 0)).unwrap();
    let reply = call(&client, Opcode::Read, &ReadReq::new(id, 64)).unwrap();
    let count = reply.value as usize;
    print!("read back: {}", String::from_utf8_lossy(&reply.page.unwrap()[..count]));

    call(&client, Opcode::Close, &FileReq::new(id)).unwrap();
    let reply = call(&client, Opcode::Info, &InfoRet::new_zeroed()).unwrap();
    let info: InfoRet = decode(&reply.page.unwrap()).unwrap();
    println!("{} of {} blocks in use", info.used_blocks.get(), info.total_blocks.get());

    drop(client);
    server.join().unwrap().expect("server failed");
}
