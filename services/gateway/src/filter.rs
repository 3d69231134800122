//! Per-session subscription filter.
//!
//! One value owns everything `subscribe` configures; the channel simply
//! asks `filter.accepts(post)` at broadcast time.

use souk_protocol::Post;

/// Upper bound on subscribed channel codes; extra entries are dropped.
pub const MAX_SUB_CHANNELS: usize = 64;
/// Upper bound on numeric range pairs; extra pairs are dropped.
pub const MAX_RANGES: usize = 5;

#[derive(Debug, Clone, Default)]
pub struct SubscriptionFilter {
    /// If non-zero, a post must share at least one feature bit.
    any_of_features: u64,
    /// Sorted channel codes; empty means every channel.
    sub_channels: Vec<u64>,
    /// (min, max) pairs checked against `post.range_values` by position.
    ranges: Vec<(i64, i64)>,
}

impl SubscriptionFilter {
    /// Build a filter from the raw `subscribe` fields.  Channel codes are
    /// silently truncated to [`MAX_SUB_CHANNELS`] and sorted; `ranges` is a
    /// flat (min, max) sequence truncated to [`MAX_RANGES`] pairs, a
    /// dangling half pair ignored.
    pub fn new(any_of_features: u64, mut sub_channels: Vec<u64>, ranges: &[i64]) -> Self {
        sub_channels.truncate(MAX_SUB_CHANNELS);
        sub_channels.sort_unstable();
        let ranges = ranges
            .chunks_exact(2)
            .take(MAX_RANGES)
            .map(|pair| (pair[0], pair[1]))
            .collect();
        SubscriptionFilter {
            any_of_features,
            sub_channels,
            ranges,
        }
    }

    /// Whether a broadcast post should be delivered to this session.
    pub fn accepts(&self, post: &Post) -> bool {
        if self.any_of_features != 0 && self.any_of_features & post.features == 0 {
            return false;
        }
        if !self.sub_channels.is_empty() && self.sub_channels.binary_search(&post.filter).is_err() {
            return false;
        }
        for (i, &(min, max)) in self.ranges.iter().enumerate() {
            let Some(&value) = post.range_values.get(i) else {
                break;
            };
            if value < min || value > max {
                return false;
            }
        }
        true
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn post(filter: u64, features: u64, range_values: Vec<i64>) -> Post {
        Post {
            id: 1,
            from: "1".to_owned(),
            body: String::new(),
            to: (vec![], vec![]),
            filter,
            features,
            date: 0,
            range_values,
        }
    }

    #[test]
    fn empty_filter_accepts_everything() {
        let f = SubscriptionFilter::default();
        assert!(f.accepts(&post(7, 0, vec![])));
        assert!(f.accepts(&post(0, u64::MAX, vec![1, 2, 3])));
    }

    #[test]
    fn features_mask_requires_an_overlapping_bit() {
        let f = SubscriptionFilter::new(0b0110, vec![], &[]);
        assert!(f.accepts(&post(0, 0b0100, vec![])));
        assert!(!f.accepts(&post(0, 0b1001, vec![])));
        assert!(!f.accepts(&post(0, 0, vec![])));
    }

    #[test]
    fn channel_codes_select_posts_by_filter_code() {
        let f = SubscriptionFilter::new(0, vec![9, 3, 5], &[]);
        assert!(f.accepts(&post(3, 0, vec![])));
        assert!(f.accepts(&post(9, 0, vec![])));
        assert!(!f.accepts(&post(4, 0, vec![])));
    }

    #[test]
    fn ranges_bound_the_matching_values() {
        let f = SubscriptionFilter::new(0, vec![], &[100, 200, 0, 10]);
        assert!(f.accepts(&post(0, 0, vec![150, 5])));
        assert!(!f.accepts(&post(0, 0, vec![99, 5])));
        assert!(!f.accepts(&post(0, 0, vec![150, 11])));
        // A post with fewer range values is only checked where values exist.
        assert!(f.accepts(&post(0, 0, vec![150])));
        assert!(f.accepts(&post(0, 0, vec![])));
    }

    #[test]
    fn channels_truncate_to_the_limit() {
        let codes: Vec<u64> = (0..100).collect();
        let f = SubscriptionFilter::new(0, codes, &[]);
        assert!(f.accepts(&post(63, 0, vec![])));
        // Codes beyond the 64th were dropped.
        assert!(!f.accepts(&post(64, 0, vec![])));
    }

    #[test]
    fn ranges_truncate_to_five_pairs_and_ignore_a_dangling_value() {
        let flat: Vec<i64> = vec![0, 10, 0, 10, 0, 10, 0, 10, 0, 10, 0, 10, 99];
        let f = SubscriptionFilter::new(0, vec![], &flat);
        // The sixth pair was dropped, so a sixth out-of-range value passes.
        assert!(f.accepts(&post(0, 0, vec![5, 5, 5, 5, 5, 999])));
        assert!(!f.accepts(&post(0, 0, vec![5, 5, 5, 5, 11])));
    }

    #[test]
    fn unsorted_channel_input_still_matches() {
        let f = SubscriptionFilter::new(0, vec![42, 7, 19], &[]);
        assert!(f.accepts(&post(7, 0, vec![])));
        assert!(f.accepts(&post(19, 0, vec![])));
        assert!(f.accepts(&post(42, 0, vec![])));
    }
}
