pub(crate) mod exams;
pub(crate) mod results;
pub(crate) mod submissions;
