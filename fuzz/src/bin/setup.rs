#[cfg(not(windows))]
mod fuzz {
    use std::sync::Arc;

    use fsverity::{
        host::CachedFile,
        info::{VerityContext, VerityInode},
    };
    use honggfuzz::fuzz;

    pub fn main() {
        let ctx = Arc::new(VerityContext::default());

        loop {
            fuzz!(|data: &[u8]| {
                // Small pages keep the tree shallow enough to explore.
                let host = CachedFile::new(data.to_vec(), 1)
                    .with_page_shift(9)
                    .with_verity(true);
                let inode = VerityInode::new(host, ctx.clone());

                if inode.file_open(false).is_ok() {
                    for index in 0..4 {
                        let start = (index * 512).min(data.len());
                        let end = (start + 512).min(data.len());
                        let _ = inode.verify_page(index as u64, &data[start..end]);
                    }
                }
            });
        }
    }
}

fn main() {
    #[cfg(not(windows))]
    fuzz::main();
}
