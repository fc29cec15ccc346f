use rand::Rng;

const PUSH_CHARS: &[u8; 64] = b"-0123456789ABCDEFGHIJKLMNOPQRSTUVWXYZ_abcdefghijklmnopqrstuvwxyz";

/// Generates 20 character keys that sort in creation order.
///
/// The first 8 characters encode the timestamp; the remaining 12 are random
/// and are incremented instead of re-drawn when two keys share a millisecond.
#[derive(Debug, Default)]
pub(crate) struct PushIdGenerator {
    last_push_time: i64,
    last_rand_chars: [u8; 12],
}

impl PushIdGenerator {
    pub(crate) fn new() -> Self {
        Self::default()
    }

    pub(crate) fn next_id(&mut self, now: i64) -> String {
        let duplicate_time = now == self.last_push_time;
        self.last_push_time = now;

        let mut remaining = now.max(0) as u64;
        let mut timestamp_chars = [0u8; 8];
        for slot in timestamp_chars.iter_mut().rev() {
            *slot = PUSH_CHARS[(remaining % 64) as usize];
            remaining /= 64;
        }

        if duplicate_time {
            self.increment_rand_chars();
        } else {
            let mut rng = rand::thread_rng();
            for slot in self.last_rand_chars.iter_mut() {
                *slot = rng.gen_range(0..64);
            }
        }

        let mut id = String::with_capacity(20);
        id.extend(timestamp_chars.iter().map(|&ch| ch as char));
        id.extend(
            self.last_rand_chars
                .iter()
                .map(|&index| PUSH_CHARS[index as usize] as char),
        );
        id
    }

    fn increment_rand_chars(&mut self) {
        let mut index = self.last_rand_chars.len();
        while index > 0 && self.last_rand_chars[index - 1] == 63 {
            self.last_rand_chars[index - 1] = 0;
            index -= 1;
        }
        if index > 0 {
            self.last_rand_chars[index - 1] += 1;
        }
    }
}
