fn main() {
    if let Err(err) = snapsync::run() {
        eprintln!("Error: {err:?}");
        std::process::exit(1);
    }
}
