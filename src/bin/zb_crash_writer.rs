//! Connects to a channel given as `argv[1]`, writes one frame, then parks
//! forever. Spawned by the writer-crash integration test, which kills this
//! process to simulate a peer dying mid-channel.

use std::time::Duration;
use zerobuffer::{ChannelOptions, Writer};

fn main() {
    let name = std::env::args().nth(1).expect("channel name argument");
    let writer = Writer::connect(&name, ChannelOptions::default()).expect("connect");
    writer.write_frame(b"hello from the doomed writer").expect("write_frame");
    loop {
        std::thread::sleep(Duration::from_secs(3600));
    }
}
