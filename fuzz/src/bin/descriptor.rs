#[cfg(not(windows))]
mod fuzz {
    use fsverity::format::descriptor;
    use honggfuzz::fuzz;

    pub fn main() {
        loop {
            fuzz!(|data: &[u8]| {
                let _ = descriptor::locate_descriptor(data, 0, 12);
                let _ = descriptor::parse(data, 12);
            });
        }
    }
}

fn main() {
    #[cfg(not(windows))]
    fuzz::main();
}
