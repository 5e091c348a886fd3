use serde_json::{json, Value};
use wiremock::matchers::{method, path};
use wiremock::{Mock, MockServer, Request, Respond, ResponseTemplate};

pub const SEARCH_PATH: &str = "/api/v2/search";
pub const PRICING_PATH: &str = "/api/vehicle/daily_pricing";

/// Marketplace stand-in: a warm-up page plus whichever API routes a test mounts.
pub struct MockMarketplace {
    server: MockServer,
}

impl MockMarketplace {
    pub async fn start() -> Self {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/"))
            .respond_with(ResponseTemplate::new(200).set_body_string("<html>home</html>"))
            .mount(&server)
            .await;
        Self { server }
    }

    pub fn uri(&self) -> String {
        self.server.uri()
    }

    pub async fn mount_search(&self, responder: DensityResponder) {
        Mock::given(method("POST"))
            .and(path(SEARCH_PATH))
            .respond_with(responder)
            .mount(&self.server)
            .await;
    }

    pub async fn mount_pricing(&self) {
        Mock::given(method("GET"))
            .and(path(PRICING_PATH))
            .respond_with(ResponseTemplate::new(200).set_body_json(pricing_body()))
            .mount(&self.server)
            .await;
    }

    pub async fn requests_to(&self, route: &str) -> usize {
        self.server
            .received_requests()
            .await
            .unwrap_or_default()
            .iter()
            .filter(|request| request.url.path() == route)
            .count()
    }

    pub async fn total_requests(&self) -> usize {
        self.server.received_requests().await.unwrap_or_default().len()
    }
}

pub fn pricing_body() -> Value {
    json!({
        "dailyPricingResponses": [{"date": "2024-01-01", "price": 55.0}],
        "calendarCurrencyHeader": "USD",
    })
}

/// Answers bounding-box searches: boxes wider than one degree are dense,
/// the rest hold a single listing named after their bottom-left corner.
pub struct DensityResponder {
    pub dense_count: usize,
    /// Bottom-left corner of a box that always answers 500.
    pub failing_corner: Option<(f64, f64)>,
}

impl DensityResponder {
    pub fn new(dense_count: usize) -> Self {
        Self {
            dense_count,
            failing_corner: None,
        }
    }

    pub fn failing_at(mut self, lat: f64, lng: f64) -> Self {
        self.failing_corner = Some((lat, lng));
        self
    }
}

impl Respond for DensityResponder {
    fn respond(&self, request: &Request) -> ResponseTemplate {
        let Ok(body) = serde_json::from_slice::<Value>(&request.body) else {
            return ResponseTemplate::new(400);
        };
        let location = &body["filters"]["location"];
        let coord = |corner: &str, axis: &str| location[corner][axis].as_f64().unwrap_or_default();
        let (bl_lat, bl_lng) = (coord("bottomLeft", "lat"), coord("bottomLeft", "lng"));
        let width = coord("topRight", "lng") - bl_lng;

        if self.failing_corner == Some((bl_lat, bl_lng)) && width <= 1.0 {
            return ResponseTemplate::new(500);
        }

        let vehicles: Vec<Value> = if width > 1.0 {
            (0..self.dense_count)
                .map(|index| json!({"id": format!("dense-{index}")}))
                .collect()
        } else {
            vec![json!({"id": format!("{bl_lat}:{bl_lng}")})]
        };
        ResponseTemplate::new(200).set_body_json(json!({"vehicles": vehicles}))
    }
}
