use crate::catalogue::{Catalogue, CatalogueError, ParameterValue, MAX_GRID_SIZE};

const CATALOGUE: &str = r#"
jobs:
  - id: 7
    label: sma_cross
    parameters:
      slow:
        values: [20, 50]
      fast:
        range: { start: 5, stop: 15, step: 5 }
      source:
        value: close
  - id: 3
    label: rsi
    parameters:
      threshold:
        range: { start: 0.5, stop: 1.5, step: 0.5 }
  - id: 12
    label: buy_and_hold
"#;

#[test]
pub fn load_and_expand() {
    let catalogue = Catalogue::from_yaml(CATALOGUE).unwrap();

    assert_eq!(catalogue.len(), 3);
    assert_eq!(catalogue.ids().into_iter().collect::<Vec<_>>(), vec![3, 7, 12]);

    let sma = catalogue.get(7).unwrap();
    assert_eq!(sma.label, "sma_cross");
    assert_eq!(sma.parameter_grid.len(), 3 * 2);

    // parameters in name order, the last name varies fastest
    let first = &sma.parameter_grid[0];
    assert_eq!(first.keys().cloned().collect::<Vec<_>>(), vec!["fast", "slow", "source"]);
    assert_eq!(first["fast"], ParameterValue::Int(5));
    assert_eq!(first["slow"], ParameterValue::Int(20));
    assert_eq!(first["source"], ParameterValue::Text("close".to_string()));
    assert_eq!(sma.parameter_grid[1]["slow"], ParameterValue::Int(50));
    assert_eq!(sma.parameter_grid[5]["fast"], ParameterValue::Int(15));
}

#[test]
pub fn float_range_is_inclusive() {
    let catalogue = Catalogue::from_yaml(CATALOGUE).unwrap();
    let thresholds = catalogue
        .get(3)
        .unwrap()
        .parameter_grid
        .iter()
        .map(|set| set["threshold"].clone())
        .collect::<Vec<_>>();

    assert_eq!(
        thresholds,
        vec![
            ParameterValue::Float(0.5),
            ParameterValue::Float(1.0),
            ParameterValue::Float(1.5)
        ]
    );
}

#[test]
pub fn job_without_parameters_runs_once() {
    let catalogue = Catalogue::from_yaml(CATALOGUE).unwrap();
    let job = catalogue.get(12).unwrap();

    assert_eq!(job.parameter_grid.len(), 1);
    assert!(job.parameter_grid[0].is_empty());
}

#[test]
pub fn duplicate_ids() {
    let result = Catalogue::from_yaml(
        "jobs:\n  - { id: 1, label: a }\n  - { id: 1, label: b }\n",
    );

    assert!(matches!(result, Err(CatalogueError::DuplicateId(1))));
}

#[test]
pub fn empty_label() {
    let result = Catalogue::from_yaml("jobs:\n  - { id: 4, label: '  ' }\n");

    assert!(matches!(result, Err(CatalogueError::EmptyLabel(4))));
}

#[test]
pub fn invalid_parameters() {
    let cases = [
        "{ values: [] }",
        "{ values: [1], value: 2 }",
        "{}",
        "{ range: { start: 1, stop: 5, step: 0 } }",
        "{ range: { start: 5, stop: 1, step: 1 } }",
    ];

    for case in cases {
        let document = format!("jobs:\n  - id: 9\n    label: x\n    parameters:\n      p: {case}\n");
        let result = Catalogue::from_yaml(&document);

        assert!(
            matches!(result, Err(CatalogueError::InvalidParameter { job: 9, .. })),
            "{case} was accepted: {result:?}"
        );
    }
}

#[test]
pub fn unknown_fields_are_rejected() {
    let result = Catalogue::from_yaml("jobs:\n  - { id: 1, label: a, weight: 3 }\n");

    assert!(matches!(result, Err(CatalogueError::Parse(_))));
}

#[test]
pub fn oversized_grid() {
    let max = MAX_GRID_SIZE * 2;
    let ranges = [
        format!("start: 0, stop: {max}, step: 1"),
        // spans beyond usize saturate instead of wrapping
        "start: 0, stop: 1.0e300, step: 1".to_string(),
        "start: -1.7e308, stop: 1.7e308, step: 0.5".to_string(),
    ];

    for range in ranges {
        let document = format!(
            "jobs:\n  - id: 2\n    label: x\n    parameters:\n      p: {{ range: {{ {range} }} }}\n"
        );

        assert!(
            matches!(
                Catalogue::from_yaml(&document),
                Err(CatalogueError::GridTooLarge { job: 2, .. })
            ),
            "accepted {range}"
        );
    }
}
