use beach_surf_core::{Document, Flash};

/// Browser side of the upgrade: opens the socket with the embedded token,
/// swaps in every render, forwards clicks on `data-surf-event` elements, and
/// follows redirects. A fault reloads the page (fresh disconnected render);
/// a dropped socket reconnects with the token it already has.
const CLIENT_SCRIPT: &str = r#"
(function () {
  var root = document.querySelector("[data-surf-session]");
  if (!root) { return; }
  var token = root.getAttribute("data-surf-session");
  var container = root.querySelector("[data-surf-root]");
  var retries = 0;

  function connect() {
    var scheme = location.protocol === "https:" ? "wss:" : "ws:";
    var ws = new WebSocket(scheme + "//" + location.host + "/live/websocket?token=" + encodeURIComponent(token));
    var finished = false;

    ws.onopen = function () { retries = 0; };
    ws.onmessage = function (msg) {
      var frame = JSON.parse(msg.data);
      if (frame.type === "render") {
        container.innerHTML = frame.rendered;
      } else if (frame.type === "redirect") {
        finished = true;
        location.assign(frame.to);
      } else if (frame.type === "disconnect") {
        finished = true;
        if (frame.reason === "fault") { location.reload(); }
      }
    };
    ws.onclose = function () {
      if (finished) { return; }
      retries += 1;
      setTimeout(connect, Math.min(10000, 250 * Math.pow(2, retries)));
    };

    root.onclick = function (e) {
      var el = e.target.closest("[data-surf-event]");
      if (!el || ws.readyState !== WebSocket.OPEN) { return; }
      e.preventDefault();
      var params = {};
      for (var key in el.dataset) {
        if (key !== "surfEvent") { params[key] = el.dataset[key]; }
      }
      ws.send(JSON.stringify({
        type: "event",
        event: el.getAttribute("data-surf-event"),
        origin: el.id || el.tagName.toLowerCase(),
        params: params
      }));
    };
  }

  connect();
})();
"#;

pub fn escape(input: &str) -> String {
    let mut out = String::with_capacity(input.len());
    for ch in input.chars() {
        match ch {
            '&' => out.push_str("&amp;"),
            '<' => out.push_str("&lt;"),
            '>' => out.push_str("&gt;"),
            '"' => out.push_str("&quot;"),
            '\'' => out.push_str("&#39;"),
            other => out.push(other),
        }
    }
    out
}

fn flash_markup(flash: &Flash) -> String {
    flash
        .iter()
        .map(|(kind, message)| {
            format!(
                "<p class=\"flash flash-{kind}\" role=\"alert\">{message}</p>",
                kind = escape(kind),
                message = escape(message)
            )
        })
        .collect()
}

/// Full page for a disconnected render. The rendered view goes in as-is;
/// everything else is escaped.
pub fn page(document: &Document, flash: &Flash) -> String {
    format!(
        "<!DOCTYPE html>\n\
         <html>\n\
         <head><meta charset=\"utf-8\"><title>{title}</title></head>\n\
         <body>\n\
         {flash}\
         <div data-surf-view=\"{view}\" data-surf-session=\"{token}\">\
         <div data-surf-root>{rendered}</div>\
         </div>\n\
         <script>{script}</script>\n\
         </body>\n\
         </html>\n",
        title = escape(&document.view),
        flash = flash_markup(flash),
        view = escape(&document.view),
        token = escape(&document.token),
        rendered = document.rendered,
        script = CLIENT_SCRIPT,
    )
}
