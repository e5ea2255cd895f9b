/// Splits a write into chunks which never cross a page boundary.
///
/// Each item is `(address, data)` for a single page program command.
/// The first chunk runs from `address` to the end of its page, every
/// following chunk starts page-aligned.
#[derive(Clone, Debug)]
pub(crate) struct PageChunks<'d> {
    address: u32,
    data: &'d [u8],
    page_size: u32,
}

impl<'d> PageChunks<'d> {
    pub fn new(address: u32, data: &'d [u8], page_size: u32) -> Self {
        PageChunks { address, data, page_size }
    }
}

impl<'d> Iterator for PageChunks<'d> {
    type Item = (u32, &'d [u8]);

    fn next(&mut self) -> Option<Self::Item> {
        if self.data.is_empty() {
            return None;
        }
        let to_boundary = (self.page_size - (self.address % self.page_size)) as usize;
        let size = usize::min(to_boundary, self.data.len());
        let (chunk, rest) = self.data.split_at(size);
        let address = self.address;
        log::trace!("Page chunk: address=0x{:08X} length={}", address, size);
        self.address += size as u32;
        self.data = rest;
        Some((address, chunk))
    }
}

#[test]
fn test_chunks_aligned() {
    let data = [0u8; 512];
    let chunks: alloc::vec::Vec<_> =
        PageChunks::new(0x100, &data, 256).map(|(a, d)| (a, d.len())).collect();
    assert_eq!(chunks, alloc::vec![(0x100, 256), (0x200, 256)]);
}

#[test]
fn test_chunks_crossing_boundary() {
    // One byte before a boundary, page_size + 1 bytes long.
    let data = [0u8; 257];
    let chunks: alloc::vec::Vec<_> =
        PageChunks::new(0xFF, &data, 256).map(|(a, d)| (a, d.len())).collect();
    assert_eq!(chunks, alloc::vec![(0xFF, 1), (0x100, 256)]);
}

#[test]
fn test_chunks_within_page() {
    let data = [0u8; 10];
    let chunks: alloc::vec::Vec<_> =
        PageChunks::new(0x1010, &data, 256).map(|(a, d)| (a, d.len())).collect();
    assert_eq!(chunks, alloc::vec![(0x1010, 10)]);
    assert_eq!(PageChunks::new(0, &[], 256).count(), 0);
}

#[test]
fn test_chunks_keep_data_order() {
    let data: alloc::vec::Vec<u8> = (0..=255u8).cycle().take(600).collect();
    let mut joined = alloc::vec::Vec::new();
    let mut sizes = alloc::vec::Vec::new();
    for (_, chunk) in PageChunks::new(0x80, &data, 256) {
        joined.extend_from_slice(chunk);
        sizes.push(chunk.len());
    }
    assert_eq!(joined, data);
    assert_eq!(sizes, alloc::vec![128, 256, 216]);
}
