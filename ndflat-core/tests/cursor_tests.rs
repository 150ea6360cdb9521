use ndflat_core::{Flat3, Layer, NdError};

fn sample() -> Flat3<i64> {
    Flat3::from_generator(&vec![
        vec![vec![1, 2], vec![], vec![3]],
        vec![],
        vec![vec![4, 5, 6, 7]],
    ])
    .unwrap()
}

#[test]
fn test_checked_accepts_below_extent_rejects_at_extent() {
    let nd = sample();
    let top = nd.checked();

    assert!(top.at(top.len()).is_err());
    for i in 0..top.len() {
        let middle = top.at(i).unwrap();

        match middle.at(middle.len()) {
            Err(NdError::OutOfRange { depth: 2, index, extent }) => {
                assert_eq!(index, extent);
            }
            other => panic!("expected OutOfRange at depth 2, got {other:?}"),
        }

        for j in 0..middle.len() {
            let leaf = middle.at(j).unwrap();
            assert!(matches!(leaf.at(leaf.len()), Err(NdError::OutOfRange { depth: 1, .. })));

            for k in 0..leaf.len() {
                assert_eq!(leaf.at(k).unwrap(), nd.at(i).at(j).at(k));
            }
        }
    }
}

#[test]
fn test_checked_and_unchecked_visit_same_order() {
    let nd = sample();
    let mut visited = Vec::new();

    let top = nd.checked();
    for i in 0..top.len() {
        let middle = top.at(i).unwrap();
        for j in 0..middle.len() {
            visited.extend(middle.at(j).unwrap().iter().copied());
        }
    }

    assert_eq!(visited, nd.values());
}

#[test]
fn test_unchecked_overrun_stays_inside_buffer() {
    let nd = sample();

    // Outer index 1 is empty; reading beneath it lands in outer index 2
    assert_eq!(*nd.at(1).at(0).at(0), 4);
}

#[test]
#[should_panic]
fn test_unchecked_overrun_past_buffer_panics() {
    let nd = sample();
    let _value = *nd.at(2).at(0).at(4);
}

#[test]
fn test_mutable_cursor_and_checked_agree() {
    let mut nd = sample();

    *nd.at_mut(2).at(0).at(3) = 70;
    *nd.checked_mut().at(0).unwrap().at(2).unwrap().at(0).unwrap() = 30;

    assert_eq!(nd.to_string(), "[[[1, 2], [], [30]], [], [[4, 5, 6, 70]]]");
}

#[test]
fn test_cursor_debug_reports_depth() {
    let nd = sample();
    let debug = format!("{:?}", nd.at(0));

    assert!(debug.contains("depth: 2"));
    assert!(format!("{:?}", nd.checked()).contains("extent: 3"));
}
