use super::Config;

impl Config {
    pub(crate) fn apply_env_overrides(&mut self) {
        self.apply_env_overrides_storage();
        self.apply_env_overrides_index();
    }

    fn apply_env_overrides_storage(&mut self) {
        if let Ok(v) = std::env::var("DELVE_STORAGE_BACKEND") {
            if let Ok(backend) = serde_json::from_value(serde_json::Value::String(v.clone())) {
                self.storage.backend = backend;
            } else {
                tracing::warn!("ignoring invalid DELVE_STORAGE_BACKEND value: {v}");
            }
        }
        if let Ok(v) = std::env::var("DELVE_SQLITE_PATH") {
            self.storage.sqlite_path = v;
        }
        if let Ok(v) = std::env::var("DELVE_EMBEDDING_BASE_URL") {
            self.embedding.base_url = v;
        }
        if let Ok(v) = std::env::var("DELVE_EMBEDDING_MODEL") {
            self.embedding.model = v;
        }
        if let Ok(v) = std::env::var("DELVE_EMBEDDING_TIMEOUT_SECS")
            && let Ok(secs) = v.parse::<u64>()
        {
            self.embedding.timeout_secs = secs;
        }
    }

    fn apply_env_overrides_index(&mut self) {
        if let Ok(v) = std::env::var("DELVE_INDEX_MAX_CHUNKS")
            && let Ok(n) = v.parse::<usize>()
        {
            self.index.max_chunks_per_file = n;
        }
        if let Ok(v) = std::env::var("DELVE_INDEX_MAX_IN_FLIGHT")
            && let Ok(n) = v.parse::<usize>()
        {
            self.index.max_in_flight = n;
        }
        if let Ok(v) = std::env::var("DELVE_INDEX_READY_RATIO")
            && let Ok(ratio) = v.parse::<f64>()
        {
            self.index.ready_ratio = ratio;
        }
        if let Ok(v) = std::env::var("DELVE_INDEX_SWEEP_INTERVAL_SECS")
            && let Ok(secs) = v.parse::<u64>()
        {
            self.index.sweep_interval_secs = secs;
        }
        if let Ok(v) = std::env::var("DELVE_QUERY_LIMIT")
            && let Ok(n) = v.parse::<usize>()
        {
            self.query.limit = n;
        }
        if let Ok(v) = std::env::var("DELVE_QUERY_MAX_RESULTS")
            && let Ok(n) = v.parse::<usize>()
        {
            self.query.max_results = n;
        }
        if let Ok(v) = std::env::var("DELVE_QUERY_DISTANCE_CEILING")
            && let Ok(ceiling) = v.parse::<f32>()
        {
            self.query.distance_ceiling = ceiling;
        }
    }
}
