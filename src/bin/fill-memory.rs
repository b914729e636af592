//! Diagnostic tool that eats memory in controlled steps, for exercising the
//! monitor on a test machine. Not part of the daemon.

use std::{
    io::{self, Write},
    thread,
    time::Duration,
};

use structopt::StructOpt;

const ONE_MB: usize = 1 << 20;
const ALLOC_STEP: usize = ONE_MB;
const ALLOC_DELAY: Duration = Duration::from_millis(1);
const PAGE_SIZE: usize = 4096;

#[derive(Debug, StructOpt)]
#[structopt(name = "fill-memory", about = "Fill memory")]
struct Opt {
    /// Stop and delay after this many MB are allocated (default is no
    /// delay).
    #[structopt(short = "s", long)]
    delay_size: Option<usize>,

    /// Length of the delay, in seconds, after allocating that many chunks.
    #[structopt(short = "d", long, default_value = "1")]
    delay: u64,
}

fn main() {
    let opt = Opt::from_args();

    match opt.delay_size {
        Some(delay_size) => println!(
            "Will allocate {} chunks of {} MB, and then pause for {} seconds",
            delay_size,
            ALLOC_STEP / ONE_MB,
            opt.delay
        ),
        None => println!("Will allocate in chunks of {} MB", ALLOC_STEP / ONE_MB),
    }

    println!("Legend:");
    println!("# allocation");
    println!("- pause");

    let mut hog: Vec<Vec<u8>> = Vec::new();
    let mut chunks_since_pause = 0;
    loop {
        let mut chunk = vec![0u8; ALLOC_STEP];
        // dirty every page so the kernel actually backs the allocation
        for (i, page) in chunk.chunks_mut(PAGE_SIZE).enumerate() {
            page[0] = (i % 255) as u8 + 1;
        }
        hog.push(chunk);
        chunks_since_pause += 1;
        print!("#");
        let _ = io::stdout().flush();

        match opt.delay_size {
            Some(delay_size) if chunks_since_pause == delay_size => {
                print!("-");
                let _ = io::stdout().flush();
                thread::sleep(Duration::from_secs(opt.delay));
                chunks_since_pause = 0;
            }
            _ => thread::sleep(ALLOC_DELAY),
        }
    }
}
