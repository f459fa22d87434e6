//! Property-Based Tests for Pagination
//!
//! # Test Properties
//!
//! 1. **Clamping**: any raw `limit` lands in `[1, max_page_size]`
//! 2. **Offset**: `offset = (page - 1) * limit` for every accepted page
//! 3. **Prefetch bounds**: prefetched pages follow the current page and exist
//! 4. **Envelope**: `total_pages` covers every item and `has_next` agrees with it

#![cfg(test)]

use proptest::prelude::*;

use super::{create_paginated_response, PaginationOptions, PaginationPlanner, PaginationQuery};
use crate::cache::Efficiency;

// =============================================================================
// Property Strategies
// =============================================================================

/// Raw query values: numbers in and out of range, plus junk
fn raw_value_strategy() -> impl Strategy<Value = Option<String>> {
    prop_oneof![
        Just(None),
        (-1_000i64..100_000).prop_map(|n| Some(n.to_string())),
        "[a-z]{0,6}".prop_map(Some),
    ]
}

fn options_strategy() -> impl Strategy<Value = PaginationOptions> {
    (any::<bool>(), prop::option::of(0u64..1_000_000)).prop_map(|(enable_prefetch, total)| {
        PaginationOptions {
            enable_prefetch,
            estimated_total_count: total,
        }
    })
}

proptest! {
    #![proptest_config(ProptestConfig::with_cases(200))]

    #[test]
    fn prop_plan_is_always_valid(
        page in raw_value_strategy(),
        limit in raw_value_strategy(),
        options in options_strategy(),
    ) {
        let planner = PaginationPlanner::default();
        let max = planner.defaults().max_page_size;
        let plan = planner.optimize_pagination(&PaginationQuery { page, limit }, &options);

        prop_assert!(plan.page >= 1);
        prop_assert!((1..=max).contains(&plan.limit));
        prop_assert_eq!(plan.offset, (plan.page - 1) * plan.limit);
        prop_assert_eq!(plan.should_prefetch, !plan.prefetch_pages.is_empty());

        if let Some(total) = options.estimated_total_count {
            let last = total.div_ceil(plan.limit);
            for (i, p) in plan.prefetch_pages.iter().enumerate() {
                prop_assert_eq!(*p, plan.page + 1 + i as u64);
                prop_assert!(*p <= last);
            }
        } else {
            prop_assert!(plan.prefetch_pages.is_empty());
        }

        if plan.optimization.use_cursor_pagination {
            prop_assert_eq!(plan.optimization.efficiency, Efficiency::Poor);
        }
    }

    #[test]
    fn prop_envelope_covers_total(
        total in 0u64..100_000,
        page in 1u64..10_000,
        limit in 1u64..=100,
        len in 0usize..=100,
    ) {
        let response = create_paginated_response(vec![(); len], total, page, limit);
        let info = &response.pagination;

        prop_assert!(info.total_pages * limit >= total);
        prop_assert!(info.total_pages == 0 || (info.total_pages - 1) * limit < total);
        prop_assert_eq!(info.has_next, page < info.total_pages);
        prop_assert_eq!(info.has_prev, page > 1);
        prop_assert_eq!(response.metadata.result_count, len);
    }
}
