//! Job type registry used to rebuild executable jobs from stored records.

use std::collections::HashMap;
use std::sync::Arc;

use crate::{Base, Job, JobRecord, JobType, QueueError, TypedJob};

/// Constructor for one job type: restores a job from its base and payload.
pub type JobConstructor =
    Arc<dyn Fn(Base, serde_json::Value) -> Result<Box<dyn Job>, serde_json::Error> + Send + Sync>;

/// Registry of job constructors keyed by `(name, version)`.
///
/// Built once at startup, then shared read-only (usually behind an `Arc`)
/// with whatever component rehydrates jobs.
#[derive(Default)]
pub struct JobRegistry {
    constructors: HashMap<JobType, JobConstructor>,
}

impl JobRegistry {
    /// Create a new empty registry.
    pub fn new() -> Self {
        Self {
            constructors: HashMap::new(),
        }
    }

    /// Register a constructor for a job type.
    pub fn register<F>(&mut self, job_type: JobType, constructor: F) -> Result<(), QueueError>
    where
        F: Fn(Base, serde_json::Value) -> Result<Box<dyn Job>, serde_json::Error>
            + Send
            + Sync
            + 'static,
    {
        if self.constructors.contains_key(&job_type) {
            return Err(QueueError::DuplicateJobType(job_type));
        }
        self.constructors.insert(job_type, Arc::new(constructor));
        Ok(())
    }

    /// Register a serde-backed job type.
    pub fn register_typed<T: TypedJob>(&mut self) -> Result<(), QueueError> {
        self.register(T::registered_type(), |base, payload| {
            let job: T = serde_json::from_value(payload)?;
            Ok(Box::new(job.with_base(base)) as Box<dyn Job>)
        })
    }

    /// Rebuild an executable job from a stored record.
    pub fn build(&self, record: JobRecord) -> Result<Box<dyn Job>, QueueError> {
        let constructor = self
            .constructors
            .get(&record.job_type)
            .ok_or_else(|| QueueError::UnknownJobType(record.job_type.clone()))?;
        let base = Base::from_record(&record);
        Ok(constructor(base, record.payload)?)
    }

    /// Check if a constructor exists for a job type.
    pub fn contains(&self, job_type: &JobType) -> bool {
        self.constructors.contains_key(job_type)
    }

    /// List all registered job types.
    pub fn job_types(&self) -> Vec<&JobType> {
        self.constructors.keys().collect()
    }
}

#[cfg(test)]
mod tests {
    use async_trait::async_trait;
    use serde::{Deserialize, Serialize};
    use tokio_util::sync::CancellationToken;

    use super::*;

    #[derive(Serialize, Deserialize)]
    struct Greeting {
        #[serde(skip)]
        base: Base,
        name: String,
    }

    #[async_trait]
    impl Job for Greeting {
        fn base(&self) -> &Base {
            &self.base
        }

        fn base_mut(&mut self) -> &mut Base {
            &mut self.base
        }

        fn payload(&self) -> Result<serde_json::Value, serde_json::Error> {
            serde_json::to_value(self)
        }

        async fn run(&mut self, _cancel: CancellationToken) {
            if self.name.is_empty() {
                self.add_error("nobody to greet".to_string());
            }
            self.mark_complete();
        }
    }

    impl TypedJob for Greeting {
        const NAME: &'static str = "greeting";
        const VERSION: u32 = 1;

        fn with_base(mut self, base: Base) -> Self {
            self.base = base;
            self
        }
    }

    fn greeting(name: &str) -> Greeting {
        Greeting {
            base: Base::new(Greeting::registered_type()),
            name: name.to_string(),
        }
    }

    #[tokio::test]
    async fn rebuilds_a_runnable_job_from_its_record() {
        let mut registry = JobRegistry::new();
        registry.register_typed::<Greeting>().unwrap();

        let original = greeting("");
        let record = original.to_record().unwrap();

        let mut job = registry.build(record).unwrap();
        assert_eq!(job.id(), original.id());
        assert_eq!(job.job_type(), &Greeting::registered_type());

        job.run(CancellationToken::new()).await;
        assert!(job.status().completed);
        assert_eq!(job.error().unwrap().to_string(), "nobody to greet");
    }

    #[test]
    fn rejects_duplicate_registration() {
        let mut registry = JobRegistry::new();
        registry.register_typed::<Greeting>().unwrap();
        let err = registry.register_typed::<Greeting>().unwrap_err();
        assert_eq!(err, QueueError::DuplicateJobType(Greeting::registered_type()));
    }

    #[test]
    fn versions_are_distinct_types() {
        let mut registry = JobRegistry::new();
        registry.register_typed::<Greeting>().unwrap();

        let mut record = greeting("x").to_record().unwrap();
        record.job_type.version = 2;
        let err = registry.build(record).err().unwrap();
        assert!(matches!(err, QueueError::UnknownJobType(t) if t.version == 2));
        assert_eq!(registry.job_types().len(), 1);
    }

    #[test]
    fn malformed_payload_is_a_serialization_error() {
        let mut registry = JobRegistry::new();
        registry.register_typed::<Greeting>().unwrap();

        let mut record = greeting("x").to_record().unwrap();
        record.payload = serde_json::json!({ "name": 7 });
        assert!(matches!(
            registry.build(record),
            Err(QueueError::Serialization(_))
        ));
    }
}
