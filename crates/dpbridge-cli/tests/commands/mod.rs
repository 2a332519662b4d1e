mod classify_test;
mod codec_test;
mod profiles_test;
