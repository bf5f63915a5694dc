#![no_main]

use libfuzzer_sys::fuzz_target;
use nvdec_filter::backend::DisplayInfo;
use nvdec_filter::decoder::display_queue::DisplayQueue;
use nvdec_filter::pool::StageId;

// Each 9-byte chunk either queues a picture (first byte even) with the timestamp in the next 8
// bytes, or pops and releases the next picture. Popped timestamps must never go backwards between
// two resets.
fuzz_target!(|data: &[u8]| {
    let mut queue = DisplayQueue::new();
    let mut last = None;

    for (i, chunk) in data.chunks_exact(9).enumerate() {
        match chunk[0] % 4 {
            0 | 2 => {
                let timestamp = u64::from_le_bytes(chunk[1..9].try_into().unwrap());
                let info = DisplayInfo {
                    picture_index: i as i32,
                    progressive_frame: chunk[0] & 0x10 != 0,
                    timestamp,
                    ..Default::default()
                };
                let queued = queue.on_picture_ready(&info, StageId(0));
                assert_eq!(queued.is_none(), timestamp > u32::MAX as u64);
                if last.is_some_and(|last| timestamp < last) {
                    last = None;
                }
            }
            1 => {
                if let Some(id) = queue.pop_next() {
                    let timestamp = queue.get(id).unwrap().timestamp;
                    assert!(last.map_or(true, |last| last <= timestamp));
                    last = Some(timestamp);
                    queue.release(id);
                }
            }
            _ => {
                queue.reset();
                last = None;
            }
        }
    }
});
