use testforge::detectors::analyzer::GoldenFile;
use testforge::detectors::mapper::map_exchanges;
use testforge::detectors::observer::parse_jsonl;
use testforge::testgen::intent::HttpMethod;

const GOLDEN: &str = r#"import requests


def test_get_user(base_url):
    user_id = 42
    r = requests.get(f"{base_url}/users/{user_id}")
    assert r.status_code == 200
"#;

const CAPTURE: &str = r#"{"method": "GET", "url": "http://localhost:5000/users/42", "status": 200, "response_body": {"id": 42, "name": "a"}}
{"method": "GET", "url": "http://localhost:5000/users/7?verbose=1", "status": 200, "response_body": {"id": 7, "name": "b"}}
not json at all
"#;

#[test]
fn golden_and_observed_paths_converge() {
    let golden = GoldenFile::parse("test_users.py", GOLDEN.to_string()).unwrap();
    let from_golden = golden.intents();
    assert_eq!(from_golden.len(), 1);

    let obs = parse_jsonl("traffic.jsonl", CAPTURE);
    assert_eq!(obs.exchanges.len(), 2);
    assert_eq!(obs.skipped.len(), 1);

    let map = map_exchanges(&obs.capture, &obs.exchanges);
    assert_eq!(map.intents.len(), 1, "two ids, one endpoint");

    let g = from_golden[0].endpoint().unwrap();
    let o = map.intents[0].endpoint().unwrap();
    assert_eq!(g, (HttpMethod::Get, "/users/{param}"));
    assert_eq!(g, o);
}

#[test]
fn distinct_methods_stay_distinct() {
    let capture = r#"{"method": "GET", "url": "/orders/9", "status": 200}
{"method": "DELETE", "url": "/orders/9", "status": 204}
"#;
    let obs = parse_jsonl("orders.jsonl", capture);
    let map = map_exchanges(&obs.capture, &obs.exchanges);
    let mut methods: Vec<HttpMethod> = map
        .intents
        .iter()
        .filter_map(|i| i.endpoint().map(|(m, _)| m))
        .collect();
    methods.sort();
    assert_eq!(methods, vec![HttpMethod::Get, HttpMethod::Delete]);
}
