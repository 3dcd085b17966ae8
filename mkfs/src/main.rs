use std::{env, fs, io, process};

fn main() -> io::Result<()> {
    let args: Vec<String> = env::args().collect();
    if args.len() < 2 {
        eprintln!("Usage: {} fs.img files...", args[0]);
        process::exit(1);
    }

    let mut builder = ox6_mkfs::ImageBuilder::new();
    for name in &args[2..] {
        let contents = fs::read(name)?;
        let short = name.rsplit('/').next().unwrap_or(name);
        builder.add_file(short, &contents);
    }
    fs::write(&args[1], builder.finish())
}
