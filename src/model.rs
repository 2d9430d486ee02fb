use std::sync::{Arc, PoisonError, RwLock};

use thiserror::Error;

use crate::labels::LABEL_COUNT;

/// Channels every engine consumes (RGB).
pub const CHANNELS: usize = 3;

/// Spatial size the loaded artifact expects.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct InputShape {
    pub height: u32,
    pub width: u32,
}

impl Default for InputShape {
    fn default() -> Self {
        Self {
            height: 240,
            width: 240,
        }
    }
}

impl InputShape {
    pub fn batch_dims(&self) -> [usize; 4] {
        [1, self.height as usize, self.width as usize, CHANNELS]
    }
}

/// Single-image batch in NHWC order with values in [0, 1].
#[derive(Debug, Clone, PartialEq)]
pub struct ImageTensor {
    pub shape: [usize; 4],
    pub data: Vec<f32>,
}

#[derive(Debug, Error)]
pub enum InferenceError {
    #[error("no model loaded")]
    Unavailable,
    #[error("tensor shape {actual:?} does not match expected {expected:?}")]
    ShapeMismatch {
        expected: [usize; 4],
        actual: [usize; 4],
    },
    #[error("inference backend failed: {0}")]
    Backend(String),
}

#[derive(Debug, Error)]
pub enum ModelLoadError {
    #[error("failed to read model artifact: {0}")]
    Io(#[from] std::io::Error),
    #[error("model emits {actual} scores but the label table has {expected} entries")]
    LabelCountMismatch { expected: usize, actual: usize },
    #[error("model backend rejected the artifact: {0}")]
    Backend(String),
    #[error("this build has no inference backend")]
    NoBackend,
}

/// A loaded classifier. Implementations whose backend is not reentrant must
/// serialise `infer` themselves.
pub trait InferenceEngine: Send + Sync {
    fn input_shape(&self) -> InputShape;

    /// Length of the score vector, when the backend can report it up front.
    fn output_len(&self) -> Option<usize>;

    fn infer(&self, input: &ImageTensor) -> Result<Vec<f32>, InferenceError>;
}

/// Owns the classifier for the lifetime of the process. Starts not ready and
/// becomes ready after a successful [`ModelHost::load`].
#[derive(Default)]
pub struct ModelHost {
    engine: RwLock<Option<Arc<dyn InferenceEngine>>>,
}

impl std::fmt::Debug for ModelHost {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ModelHost")
            .field("ready", &self.is_ready())
            .field("input_shape", &self.input_shape())
            .finish()
    }
}

impl ModelHost {
    pub fn not_ready() -> Self {
        Self::default()
    }

    /// Builds a host that is ready immediately, or returns the load error.
    pub fn with_engine<E>(engine: E) -> Result<Self, ModelLoadError>
    where
        E: InferenceEngine + 'static,
    {
        let host = Self::not_ready();
        host.load(|| Ok(engine))?;
        Ok(host)
    }

    /// Runs `loader` and installs the engine it produces. A failed load keeps
    /// whatever engine was installed before.
    pub fn load<E, F>(&self, loader: F) -> Result<(), ModelLoadError>
    where
        E: InferenceEngine + 'static,
        F: FnOnce() -> Result<E, ModelLoadError>,
    {
        let engine = loader().and_then(|engine| {
            match engine.output_len() {
                Some(actual) if actual != LABEL_COUNT => Err(ModelLoadError::LabelCountMismatch {
                    expected: LABEL_COUNT,
                    actual,
                }),
                _ => Ok(engine),
            }
        });

        match engine {
            Ok(engine) => {
                let shape = engine.input_shape();
                let engine: Arc<dyn InferenceEngine> = Arc::new(engine);
                *self.engine.write().unwrap_or_else(PoisonError::into_inner) = Some(engine);
                tracing::info!(
                    height = shape.height,
                    width = shape.width,
                    "Model loaded successfully"
                );
                Ok(())
            }
            Err(err) => {
                tracing::error!("Error loading model: {}", err);
                Err(err)
            }
        }
    }

    pub fn is_ready(&self) -> bool {
        self.ready_model().is_some()
    }

    pub fn input_shape(&self) -> Option<InputShape> {
        self.ready_model().map(|model| model.input_shape())
    }

    /// The engine installed right now. Holding it keeps that engine alive
    /// across a concurrent reload, so one request sees one model throughout.
    pub fn ready_model(&self) -> Option<ReadyModel> {
        self.engine
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
            .map(ReadyModel)
    }

    /// Scores for a `(1, H, W, 3)` tensor against the current engine.
    pub fn infer(&self, input: &ImageTensor) -> Result<Vec<f32>, InferenceError> {
        self.ready_model()
            .ok_or(InferenceError::Unavailable)?
            .infer(input)
    }
}

/// Snapshot of a loaded engine taken from [`ModelHost::ready_model`].
#[derive(Clone)]
pub struct ReadyModel(Arc<dyn InferenceEngine>);

impl ReadyModel {
    pub fn input_shape(&self) -> InputShape {
        self.0.input_shape()
    }

    pub fn infer(&self, input: &ImageTensor) -> Result<Vec<f32>, InferenceError> {
        let expected = self.0.input_shape().batch_dims();
        if input.shape != expected || input.data.len() != expected.iter().product::<usize>() {
            return Err(InferenceError::ShapeMismatch {
                expected,
                actual: input.shape,
            });
        }

        self.0.infer(input)
    }
}

/// Checks a graph input signature (`None` = unknown rank or dimension)
/// against the configured image size. Only known dimensions are compared.
#[cfg_attr(not(feature = "tensorflow"), allow(dead_code))]
pub(crate) fn check_input_dims(
    dims: Option<&[Option<i64>]>,
    shape: InputShape,
) -> Result<(), ModelLoadError> {
    let Some(dims) = dims else {
        return Ok(());
    };
    if dims.len() != 4 {
        return Err(ModelLoadError::Backend(format!(
            "model input has rank {}, expected 4 (NHWC)",
            dims.len()
        )));
    }

    let expected = [
        (1, i64::from(shape.height), "height"),
        (2, i64::from(shape.width), "width"),
        (3, CHANNELS as i64, "channels"),
    ];
    for (axis, want, name) in expected {
        if let Some(actual) = dims[axis].filter(|dim| *dim >= 0) {
            if actual != want {
                return Err(ModelLoadError::Backend(format!(
                    "model input {name} is {actual}, configured {want}"
                )));
            }
        }
    }
    Ok(())
}

/// Score-vector length from a graph output signature, when it is known.
#[cfg_attr(not(feature = "tensorflow"), allow(dead_code))]
pub(crate) fn output_len_from_dims(dims: Option<&[Option<i64>]>) -> Option<usize> {
    dims?
        .last()
        .copied()
        .flatten()
        .filter(|dim| *dim > 0)
        .map(|dim| dim as usize)
}

#[cfg(feature = "tensorflow")]
pub use self::tensorflow_engine::TensorFlowEngine;

#[cfg(feature = "tensorflow")]
mod tensorflow_engine {
    use std::{fs, path::Path, sync::Mutex};

    use tensorflow::{
        Graph, ImportGraphDefOptions, Operation, Output, Session, SessionOptions, SessionRunArgs,
        Shape, Tensor,
    };

    use super::{
        check_input_dims, output_len_from_dims, ImageTensor, InferenceEngine, InferenceError,
        InputShape, ModelLoadError,
    };

    /// Frozen TensorFlow graph with a single image input and a score output.
    pub struct TensorFlowEngine {
        session: Mutex<Session>,
        graph: Graph,
        input_op: String,
        output_op: String,
        shape: InputShape,
        output_len: Option<usize>,
    }

    fn backend(status: tensorflow::Status) -> ModelLoadError {
        ModelLoadError::Backend(status.to_string())
    }

    fn find_operation(graph: &Graph, name: &str) -> Result<Operation, ModelLoadError> {
        graph
            .operation_by_name(name)
            .map_err(backend)?
            .ok_or_else(|| ModelLoadError::Backend(format!("operation '{name}' not found in graph")))
    }

    fn known_dims(shape: &Shape) -> Option<Vec<Option<i64>>> {
        shape.dims().map(|rank| (0..rank).map(|axis| shape[axis]).collect())
    }

    impl TensorFlowEngine {
        /// Imports the graph and checks its input and output signatures
        /// against `shape` and the label table before opening a session.
        pub fn load(
            model_path: &Path,
            input_op: &str,
            output_op: &str,
            shape: InputShape,
        ) -> Result<Self, ModelLoadError> {
            let model_bytes = fs::read(model_path)?;

            let mut graph = Graph::new();
            graph
                .import_graph_def(&model_bytes, &ImportGraphDefOptions::new())
                .map_err(backend)?;

            let input_operation = find_operation(&graph, input_op)?;
            let output_operation = find_operation(&graph, output_op)?;

            let input_dims = graph
                .tensor_shape(Output {
                    operation: input_operation,
                    index: 0,
                })
                .map_err(backend)?;
            check_input_dims(known_dims(&input_dims).as_deref(), shape)?;

            let output_dims = graph
                .tensor_shape(Output {
                    operation: output_operation,
                    index: 0,
                })
                .map_err(backend)?;
            let output_len = output_len_from_dims(known_dims(&output_dims).as_deref());
            if output_len.is_none() {
                tracing::warn!(
                    operation = output_op,
                    "Model output length is not static; label count cannot be checked at load"
                );
            }

            let session = Session::new(&SessionOptions::new(), &graph).map_err(backend)?;

            Ok(Self {
                session: Mutex::new(session),
                graph,
                input_op: input_op.to_string(),
                output_op: output_op.to_string(),
                shape,
                output_len,
            })
        }

        fn operation(&self, name: &str) -> Result<Operation, InferenceError> {
            self.graph
                .operation_by_name(name)
                .map_err(|status| InferenceError::Backend(status.to_string()))?
                .ok_or_else(|| InferenceError::Backend(format!("operation '{name}' not found")))
        }
    }

    impl InferenceEngine for TensorFlowEngine {
        fn input_shape(&self) -> InputShape {
            self.shape
        }

        fn output_len(&self) -> Option<usize> {
            self.output_len
        }

        fn infer(&self, input: &ImageTensor) -> Result<Vec<f32>, InferenceError> {
            let dims: Vec<u64> = input.shape.iter().map(|dim| *dim as u64).collect();
            let mut tensor = Tensor::<f32>::new(&dims);
            tensor.copy_from_slice(&input.data);

            let input_operation = self.operation(&self.input_op)?;
            let output_operation = self.operation(&self.output_op)?;

            let mut args = SessionRunArgs::new();
            args.add_feed(&input_operation, 0, &tensor);
            let output_token = args.request_fetch(&output_operation, 0);

            let session = self
                .session
                .lock()
                .map_err(|_| InferenceError::Backend("session lock poisoned".into()))?;
            session
                .run(&mut args)
                .map_err(|status| InferenceError::Backend(status.to_string()))?;
            drop(session);

            let output: Tensor<f32> = args
                .fetch(output_token)
                .map_err(|status| InferenceError::Backend(status.to_string()))?;
            Ok(output.to_vec())
        }
    }
}


#[cfg(test)]
mod tests {
    use super::testing::FixedEngine;
    use super::*;

    fn tensor_for(shape: InputShape) -> ImageTensor {
        let dims = shape.batch_dims();
        ImageTensor {
            shape: dims,
            data: vec![0.5; dims.iter().product()],
        }
    }

    #[test]
    fn not_ready_host_reports_unavailable() {
        let host = ModelHost::not_ready();
        assert!(!host.is_ready());
        assert_eq!(host.input_shape(), None);
        let result = host.infer(&tensor_for(InputShape::default()));
        assert!(matches!(result, Err(InferenceError::Unavailable)));
    }

    #[test]
    fn failed_load_leaves_host_not_ready_and_reload_recovers() {
        let host = ModelHost::not_ready();
        let failed = host.load(|| -> Result<Arc<FixedEngine>, _> {
            Err(ModelLoadError::Io(std::io::Error::new(
                std::io::ErrorKind::NotFound,
                "missing",
            )))
        });
        assert!(failed.is_err());
        assert!(!host.is_ready());

        let engine = Arc::new(FixedEngine::new(vec![0.0; LABEL_COUNT]));
        host.load(|| Ok(engine)).unwrap();
        assert!(host.is_ready());
    }

    #[test]
    fn label_count_mismatch_is_rejected_at_load() {
        let mut engine = FixedEngine::new(vec![0.5, 0.5]);
        engine.report_len = true;
        let result = ModelHost::with_engine(Arc::new(engine));
        assert!(matches!(
            result,
            Err(ModelLoadError::LabelCountMismatch {
                expected: 7,
                actual: 2
            })
        ));
    }

    #[test]
    fn wrong_tensor_shape_is_rejected_before_engine_runs() {
        let engine = Arc::new(FixedEngine::new(vec![0.0; LABEL_COUNT]));
        let host = ModelHost::with_engine(engine.clone()).unwrap();

        let result = host.infer(&tensor_for(InputShape {
            height: 3,
            width: 3,
        }));
        assert!(matches!(result, Err(InferenceError::ShapeMismatch { .. })));
        assert!(engine.seen.lock().unwrap().is_empty());
    }

    #[test]
    fn graph_input_must_match_configured_size() {
        let shape = InputShape::default();
        let matching = [None, Some(240), Some(240), Some(3)];
        assert!(check_input_dims(Some(&matching[..]), shape).is_ok());

        let dynamic = [Some(-1), None, None, Some(3)];
        assert!(check_input_dims(Some(&dynamic[..]), shape).is_ok());
        assert!(check_input_dims(None, shape).is_ok());

        let wrong_size = [None, Some(224), Some(224), Some(3)];
        assert!(matches!(
            check_input_dims(Some(&wrong_size[..]), shape),
            Err(ModelLoadError::Backend(_))
        ));

        let grayscale = [None, Some(240), Some(240), Some(1)];
        assert!(check_input_dims(Some(&grayscale[..]), shape).is_err());

        let flat = [None, Some(240 * 240 * 3)];
        assert!(check_input_dims(Some(&flat[..]), shape).is_err());
    }

    #[test]
    fn output_length_comes_from_last_known_dimension() {
        let len = |dims: &[Option<i64>]| output_len_from_dims(Some(dims));
        assert_eq!(len(&[None, Some(7)]), Some(7));
        assert_eq!(len(&[Some(1), Some(9)]), Some(9));
        assert_eq!(len(&[None, None]), None);
        assert_eq!(len(&[None, Some(-1)]), None);
        assert_eq!(output_len_from_dims(None), None);
    }

    #[test]
    fn graph_reporting_wrong_class_count_never_becomes_ready() {
        let mut engine = FixedEngine::new(vec![0.1; 9]);
        engine.report_len = true;
        let host = ModelHost::not_ready();

        let result = host.load(|| Ok(Arc::new(engine)));
        assert!(matches!(
            result,
            Err(ModelLoadError::LabelCountMismatch { actual: 9, .. })
        ));
        assert!(!host.is_ready());
    }

    #[test]
    fn ready_host_returns_engine_scores() {
        let scores = vec![0.1, 0.2, 0.3, 0.1, 0.1, 0.1, 0.1];
        let engine = Arc::new(FixedEngine::new(scores.clone()));
        let host = ModelHost::with_engine(engine.clone()).unwrap();

        let output = host.infer(&tensor_for(engine.shape)).unwrap();
        assert_eq!(output, scores);
    }
}
