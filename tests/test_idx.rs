//! Property tests for index composition and application.

use ndarray::ArrayD;
use proptest::prelude::*;
use telos::{Idx, IO};

fn array_with(rows: usize, cols: usize) -> ArrayD<f32> {
    ArrayD::from_shape_fn(vec![rows, cols], |ix| (ix[0] * cols + ix[1]) as f32)
}

proptest! {
    #[test]
    fn identity_is_left_unit(indices in prop::collection::vec(0usize..16, 1..8)) {
        let idx = Idx::new(indices, 0);
        let composed = Idx::identity().sub(&idx).unwrap();
        prop_assert_eq!(composed, idx);
    }

    #[test]
    fn identity_is_right_unit(indices in prop::collection::vec(0usize..16, 1..8)) {
        let idx = Idx::new(indices, 0);
        let composed = idx.sub(&Idx::identity()).unwrap();
        prop_assert_eq!(composed, idx);
    }

    #[test]
    fn composition_matches_sequential_application(
        outer in prop::collection::vec(0usize..12, 1..6),
        picks in prop::collection::vec(0usize..6, 1..6),
    ) {
        // Keep the inner index within the outer selection's bounds.
        let inner: Vec<usize> = picks.iter().map(|&p| p % outer.len()).collect();
        let outer_idx = Idx::new(outer, 0);
        let inner_idx = Idx::new(inner, 0);

        let io = IO::from_array(array_with(12, 3));
        let composed = outer_idx.sub(&inner_idx).unwrap();

        let at_once = composed.apply(&io, false);
        let sequential = inner_idx.apply(&outer_idx.apply(&io, false), false);
        prop_assert_eq!(
            at_once.f().unwrap().to_array(),
            sequential.f().unwrap().to_array()
        );
    }

    #[test]
    fn select_gathers_requested_rows(indices in prop::collection::vec(0usize..10, 1..8)) {
        let io = IO::from_array(array_with(10, 2));
        let idx = Idx::new(indices.clone(), 0);
        let selected = idx.apply(&io, false);

        let result = selected.f().unwrap().to_array();
        prop_assert_eq!(result.shape(), &[indices.len(), 2]);
        for (k, &row) in indices.iter().enumerate() {
            prop_assert_eq!(result[[k, 0]], (row * 2) as f32);
        }
    }
}

#[test]
fn composition_out_of_bounds_is_an_error() {
    let outer = Idx::new(vec![1, 2], 0);
    let inner = Idx::new(vec![5], 0);
    assert!(outer.sub(&inner).is_err());
}
